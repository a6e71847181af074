//! Per-layer crossfade engine
//!
//! A crossfade moves a layer from its current source node to a target node
//! through two temporary gains: the outgoing gain ramps from the layer's
//! current volume down to epsilon while the incoming gain ramps up to it,
//! both scheduled on the audio clock for the same window so total layer
//! level is conserved throughout. On completion the target is rewired
//! through the layer's main gain path and the old source stops.
//!
//! At most one crossfade runs per layer; starting another cancels and
//! supersedes the first.

use crate::error::Result;
use crate::host::{AudioHost, NodeId};
use crate::playback::VolumeController;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Crossfade progress callback: `(layer, fraction_done)`
pub type CrossfadeProgressFn = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Progress timer interval (20 Hz)
const PROGRESS_TICK: Duration = Duration::from_millis(50);

/// Epsilon floor for the fading gains; avoids denormals and start clicks
const EPSILON_GAIN: f32 = 0.001;

/// Parameters for one crossfade
pub struct CrossfadeParams {
    pub layer: String,

    /// Currently audible node, faded out
    pub source_node: NodeId,

    /// Incoming node, faded in
    pub target_node: NodeId,

    /// Layer volume at the start; the conserved total
    pub current_volume: f32,

    pub duration_ms: u64,

    /// Carry the source's relative position over to the target
    pub sync_position: bool,

    pub on_progress: Option<CrossfadeProgressFn>,
}

struct ActiveCrossfade {
    gen: u64,
    g_out: NodeId,
    g_in: NodeId,
    source: NodeId,
    target: NodeId,
    current_volume: f32,
    /// Fraction done, updated by the progress timer
    progress: f64,
    started_at: f64,
    duration_secs: f64,
}

/// Crossfade engine
pub struct CrossfadeEngine {
    host: Arc<AudioHost>,
    volume: Arc<VolumeController>,
    active: Mutex<HashMap<String, ActiveCrossfade>>,
    next_gen: AtomicU64,
    min_fade_secs: f64,
    max_fade_secs: f64,
}

impl CrossfadeEngine {
    pub fn new(
        host: Arc<AudioHost>,
        volume: Arc<VolumeController>,
        min_fade_secs: f64,
        max_fade_secs: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            volume,
            active: Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
            min_fade_secs,
            max_fade_secs,
        })
    }

    /// Run a crossfade to completion
    ///
    /// Resolves `true` on completion, `false` when cancelled, superseded or
    /// rolled back after a wiring failure. Failure rollback leaves the
    /// source wired through the layer's main path so audio keeps playing.
    pub async fn crossfade(&self, params: CrossfadeParams) -> bool {
        let duration_secs = (params.duration_ms as f64 / 1000.0)
            .clamp(self.min_fade_secs, self.max_fade_secs);
        let layer = params.layer.clone();

        // Supersede any crossfade already running on this layer. The old
        // target is usually this crossfade's source, so keep it wired; the
        // old source is on its way out either way.
        if self.is_active(&layer) {
            debug!(layer = %layer, "superseding active crossfade");
            self.cancel(&layer, false, true);
        }

        let my_gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let now = self.host.now();

        if let Err(error) = self.wire_up(&params, my_gen, now, duration_secs) {
            warn!(layer = %layer, %error, "crossfade wiring failed; rolling back");
            self.rollback(&params);
            return false;
        }

        // Wall-clock progress timer; completion is declared after the full
        // tick count rather than by watching the audio clock.
        let total_ticks = ((duration_secs / PROGRESS_TICK.as_secs_f64()).round() as u64).max(1);
        for tick in 1..=total_ticks {
            tokio::time::sleep(PROGRESS_TICK).await;
            let fraction = tick as f64 / total_ticks as f64;
            {
                let mut active = self.active.lock().unwrap();
                match active.get_mut(&layer) {
                    Some(entry) if entry.gen == my_gen => entry.progress = fraction,
                    _ => {
                        debug!(layer = %layer, "crossfade cancelled mid-flight");
                        return false;
                    }
                }
            }
            if let Some(report) = &params.on_progress {
                report(&layer, fraction);
            }
        }

        self.finish(&layer, my_gen)
    }

    /// Build the temporary gain topology and schedule the ramps
    fn wire_up(
        &self,
        params: &CrossfadeParams,
        gen: u64,
        now: f64,
        duration_secs: f64,
    ) -> Result<()> {
        let backend = self.host.backend();
        let bus = self.host.mix_bus();
        let volume = params.current_volume.clamp(0.0, 1.0);

        let g_out = backend.create_gain(volume);
        let g_in = backend.create_gain(EPSILON_GAIN);

        let result = (|| -> Result<()> {
            backend.disconnect(params.source_node)?;
            backend.disconnect(params.target_node)?;
            backend.connect(params.source_node, g_out)?;
            backend.connect(g_out, bus)?;
            backend.connect(params.target_node, g_in)?;
            backend.connect(g_in, bus)?;

            if params.sync_position {
                let source_len = backend.source_duration(params.source_node);
                let target_len = backend.source_duration(params.target_node);
                if source_len > 0.0 && target_len > 0.0 {
                    let position = (backend.source_position(params.source_node)
                        * target_len
                        / source_len)
                        .clamp(0.0, target_len);
                    backend.seek_source(params.target_node, position)?;
                }
            }

            if !backend.source_playing(params.target_node) {
                backend.start_source(params.target_node)?;
            }

            backend.set_gain_at(g_out, volume, now)?;
            backend.ramp_gain_to(g_out, EPSILON_GAIN, now + duration_secs)?;
            backend.set_gain_at(g_in, EPSILON_GAIN, now)?;
            backend.ramp_gain_to(g_in, volume, now + duration_secs)?;
            Ok(())
        })();

        if let Err(error) = result {
            backend.release(g_out);
            backend.release(g_in);
            return Err(error);
        }

        self.active.lock().unwrap().insert(
            params.layer.clone(),
            ActiveCrossfade {
                gen,
                g_out,
                g_in,
                source: params.source_node,
                target: params.target_node,
                current_volume: volume,
                progress: 0.0,
                started_at: now,
                duration_secs,
            },
        );
        debug!(
            layer = %params.layer,
            duration_secs,
            volume,
            "crossfade started"
        );
        Ok(())
    }

    /// Complete a crossfade: drop temporaries, rewire the target through
    /// the layer path, stop the old source
    fn finish(&self, layer: &str, gen: u64) -> bool {
        let entry = {
            let mut active = self.active.lock().unwrap();
            match active.get(layer) {
                Some(entry) if entry.gen == gen => active.remove(layer).unwrap(),
                _ => return false,
            }
        };

        let backend = self.host.backend();
        let _ = backend.disconnect(entry.target);
        backend.release(entry.g_out);
        backend.release(entry.g_in);

        if let Err(error) = self.volume.connect_to_layer(layer, entry.target) {
            warn!(layer, %error, "rewiring target after crossfade failed");
        }
        if let Err(error) = backend.stop_source(entry.source) {
            debug!(layer, %error, "stopping old source failed");
        }
        let _ = backend.disconnect(entry.source);

        debug!(layer, "crossfade complete");
        true
    }

    /// Cancel the layer's crossfade, releasing temporaries
    ///
    /// `reconnect_source` / `reconnect_target` rewire the respective node
    /// through the layer's main path so whichever should stay audible does.
    pub fn cancel(&self, layer: &str, reconnect_source: bool, reconnect_target: bool) {
        let Some(entry) = self.active.lock().unwrap().remove(layer) else {
            return;
        };

        let backend = self.host.backend();
        let _ = backend.disconnect(entry.source);
        let _ = backend.disconnect(entry.target);
        backend.release(entry.g_out);
        backend.release(entry.g_in);

        if reconnect_source {
            if let Err(error) = self.volume.connect_to_layer(layer, entry.source) {
                warn!(layer, %error, "reconnecting source after cancel failed");
            }
        } else {
            let _ = backend.stop_source(entry.source);
        }
        if reconnect_target {
            if let Err(error) = self.volume.connect_to_layer(layer, entry.target) {
                warn!(layer, %error, "reconnecting target after cancel failed");
            }
        } else {
            let _ = backend.stop_source(entry.target);
        }
        debug!(layer, "crossfade cancelled");
    }

    /// Cancel every active crossfade (stop/reset path)
    pub fn cancel_all(&self) {
        let layers: Vec<String> = self.active.lock().unwrap().keys().cloned().collect();
        for layer in layers {
            self.cancel(&layer, true, false);
        }
    }

    /// Retarget the conserved volume of a crossfade in flight
    ///
    /// At progress `p` the outgoing gain moves to `v·(1−p)` and the
    /// incoming to `v·p`, then both ramps are rescheduled to the adjusted
    /// endpoints over the remaining window. The stored volume becomes `v`,
    /// which is what the completion rewire reports.
    pub fn adjust_volume(&self, layer: &str, new_volume: f32) -> Result<()> {
        let new_volume = new_volume.clamp(0.0, 1.0);
        let mut active = self.active.lock().unwrap();
        let entry = active.get_mut(layer).ok_or_else(|| crate::EngineError::NotFound {
            kind: "crossfade",
            id: layer.to_string(),
        })?;

        let backend = self.host.backend();
        let now = self.host.now();
        let end = entry.started_at + entry.duration_secs;
        let p = entry.progress as f32;

        backend.cancel_ramps(entry.g_out)?;
        backend.set_gain_at(entry.g_out, new_volume * (1.0 - p), now)?;
        backend.ramp_gain_to(entry.g_out, EPSILON_GAIN, end.max(now))?;

        backend.cancel_ramps(entry.g_in)?;
        backend.set_gain_at(entry.g_in, new_volume * p, now)?;
        backend.ramp_gain_to(entry.g_in, new_volume, end.max(now))?;

        entry.current_volume = new_volume;
        self.volume.set_volume_ramped(layer, new_volume, 0.0)?;
        debug!(layer, new_volume, progress = entry.progress, "crossfade volume adjusted");
        Ok(())
    }

    /// Whether a crossfade is active on the layer
    pub fn is_active(&self, layer: &str) -> bool {
        self.active.lock().unwrap().contains_key(layer)
    }

    /// Progress of the layer's crossfade, if one is active
    pub fn progress(&self, layer: &str) -> Option<f64> {
        self.active.lock().unwrap().get(layer).map(|e| e.progress)
    }

    /// Conserved volume of the layer's crossfade, if one is active
    pub fn current_volume(&self, layer: &str) -> Option<f32> {
        self.active
            .lock()
            .unwrap()
            .get(layer)
            .map(|e| e.current_volume)
    }

    /// Best-effort rewire after a failed setup
    fn rollback(&self, params: &CrossfadeParams) {
        let backend = self.host.backend();
        let _ = backend.disconnect(params.source_node);
        if let Err(error) = self.volume.connect_to_layer(&params.layer, params.source_node) {
            warn!(layer = %params.layer, %error, "crossfade rollback failed");
        }
        let _ = backend.stop_source(params.target_node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmBuffer;
    use crate::host::{AudioBackend, MockBackend};

    fn buffer(secs: f64) -> Arc<PcmBuffer> {
        let frames = (secs * 44_100.0) as usize;
        Arc::new(PcmBuffer {
            samples: vec![0.5; frames * 2],
            sample_rate: 44_100,
            source_channels: 2,
            source_sample_rate: 44_100,
        })
    }

    struct Rig {
        backend: Arc<MockBackend>,
        volume: Arc<VolumeController>,
        engine: Arc<CrossfadeEngine>,
    }

    fn setup() -> Rig {
        let backend = Arc::new(MockBackend::new());
        let host = AudioHost::initialize(
            backend.clone() as Arc<dyn AudioBackend>,
            0.01,
            false,
        )
        .unwrap();
        let volume = VolumeController::new(Arc::clone(&host), 0.01);
        let engine = CrossfadeEngine::new(host, Arc::clone(&volume), 0.05, 30.0);
        Rig {
            backend,
            volume,
            engine,
        }
    }

    fn prepared_source(rig: &Rig, layer: &str, secs: f64) -> NodeId {
        let source = rig.backend.create_source(buffer(secs));
        rig.volume.connect_to_layer(layer, source).unwrap();
        rig.backend.start_source(source).unwrap();
        source
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossfade_completes_and_rewires() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 0.6, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        let target = rig.backend.create_source(buffer(10.0));

        let ok = rig
            .engine
            .crossfade(CrossfadeParams {
                layer: "drone".into(),
                source_node: source,
                target_node: target,
                current_volume: 0.6,
                duration_ms: 2_000,
                sync_position: false,
                on_progress: None,
            })
            .await;
        assert!(ok);
        assert!(!rig.engine.is_active("drone"));

        // target wired through the layer gain, source stopped
        assert_eq!(
            rig.backend.output_of(target),
            Some(rig.volume.layer_gain("drone"))
        );
        assert!(!rig.backend.source_playing(source));
        assert!(rig.backend.source_playing(target));
        assert!((rig.backend.path_gain(target) - 0.6).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gain_conservation_mid_fade() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 0.6, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        let target = rig.backend.create_source(buffer(10.0));

        let engine = Arc::clone(&rig.engine);
        let handle = tokio::spawn(async move {
            engine
                .crossfade(CrossfadeParams {
                    layer: "drone".into(),
                    source_node: source,
                    target_node: target,
                    current_volume: 0.6,
                    duration_ms: 2_000,
                    sync_position: false,
                    on_progress: None,
                })
                .await
        });

        // halfway through, combined path gain equals the layer volume
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let total = rig.backend.path_gain(source) + rig.backend.path_gain(target);
        assert!(
            (total - 0.6).abs() < 0.6 * 0.01 + EPSILON_GAIN,
            "total = {total}"
        );
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_cancels_previous() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 0.5, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        let target_a = rig.backend.create_source(buffer(10.0));
        let target_b = rig.backend.create_source(buffer(10.0));

        let engine = Arc::clone(&rig.engine);
        let first = tokio::spawn(async move {
            engine
                .crossfade(CrossfadeParams {
                    layer: "drone".into(),
                    source_node: source,
                    target_node: target_a,
                    current_volume: 0.5,
                    duration_ms: 5_000,
                    sync_position: false,
                    on_progress: None,
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        let ok = rig
            .engine
            .crossfade(CrossfadeParams {
                layer: "drone".into(),
                source_node: target_a,
                target_node: target_b,
                current_volume: 0.5,
                duration_ms: 500,
                sync_position: false,
                on_progress: None,
            })
            .await;

        assert!(ok);
        assert!(!first.await.unwrap());
        assert_eq!(
            rig.backend.output_of(target_b),
            Some(rig.volume.layer_gain("drone"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjust_volume_mid_fade() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 0.6, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        let target = rig.backend.create_source(buffer(10.0));

        let engine = Arc::clone(&rig.engine);
        let handle = tokio::spawn(async move {
            engine
                .crossfade(CrossfadeParams {
                    layer: "drone".into(),
                    source_node: source,
                    target_node: target,
                    current_volume: 0.6,
                    duration_ms: 2_000,
                    sync_position: false,
                    on_progress: None,
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        rig.engine.adjust_volume("drone", 0.8).unwrap();
        assert_eq!(rig.engine.current_volume("drone"), Some(0.8));

        assert!(handle.await.unwrap());
        // final layer volume reflects the adjustment
        assert!((rig.backend.path_gain(target) - 0.8).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_position_scales_target() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 1.0, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        tokio::time::sleep(Duration::from_secs(5)).await; // source at 5s of 10s

        let target = rig.backend.create_source(buffer(4.0));
        let engine = Arc::clone(&rig.engine);
        let handle = tokio::spawn(async move {
            engine
                .crossfade(CrossfadeParams {
                    layer: "drone".into(),
                    source_node: source,
                    target_node: target,
                    current_volume: 1.0,
                    duration_ms: 100,
                    sync_position: true,
                    on_progress: None,
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // target synced to 5/10 * 4 = 2s, minus the few ms since start
        let position = rig.backend.source_position(target);
        assert!((position - 2.0).abs() < 0.1, "position = {position}");
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reported_at_20hz() {
        let rig = setup();
        rig.volume.set_volume_ramped("drone", 0.5, 0.0).unwrap();
        let source = prepared_source(&rig, "drone", 10.0);
        let target = rig.backend.create_source(buffer(10.0));

        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let ok = rig
            .engine
            .crossfade(CrossfadeParams {
                layer: "drone".into(),
                source_node: source,
                target_node: target,
                current_volume: 0.5,
                duration_ms: 1_000,
                sync_position: false,
                on_progress: Some(Arc::new(move |_, fraction| {
                    seen_in.lock().unwrap().push(fraction);
                })),
            })
            .await;
        assert!(ok);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert_eq!(*seen.last().unwrap(), 1.0);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
