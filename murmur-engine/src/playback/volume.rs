//! Per-layer volume control
//!
//! One gain node per layer, created lazily and wired to the host's mix bus.
//! Every volume change is a scheduled set or a scheduled ramp; a gain is
//! never written while an earlier ramp is still outstanding without
//! cancelling it first, which is what keeps level changes click-free.

use crate::error::Result;
use crate::host::{AudioHost, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Fade progress callback: `(layer, current_value, fraction_done)`
pub type FadeProgressFn = Arc<dyn Fn(&str, f32, f64) + Send + Sync>;

/// Progress callback interval (20 Hz)
const FADE_TICK: Duration = Duration::from_millis(50);

struct LayerGain {
    node: NodeId,
    /// Logical target volume; what `get_volume` reports
    volume: f32,
    /// Pre-mute volume stash
    muted_from: Option<f32>,
    /// Bumped by any new volume operation; running fades observe it and
    /// resolve false when superseded
    fade_gen: u64,
}

/// Per-layer gain mediator
pub struct VolumeController {
    host: Arc<AudioHost>,
    layers: Mutex<HashMap<String, LayerGain>>,
    /// Ramp used for "immediate" sets
    ramp_secs: f64,
}

impl VolumeController {
    pub fn new(host: Arc<AudioHost>, ramp_secs: f64) -> Arc<Self> {
        Arc::new(Self {
            host,
            layers: Mutex::new(HashMap::new()),
            ramp_secs,
        })
    }

    /// The layer's gain node, created on first reference
    pub fn layer_gain(&self, layer: &str) -> NodeId {
        let mut layers = self.layers.lock().unwrap();
        self.ensure_locked(&mut layers, layer)
    }

    /// Set a layer volume through the short default ramp
    ///
    /// Clamps to `[0, 1]`, cancels any outstanding ramp on the layer and
    /// updates the logical volume.
    pub fn set_volume(&self, layer: &str, volume: f32) -> Result<()> {
        self.set_volume_ramped(layer, volume, self.ramp_secs)
    }

    /// Set a layer volume with an explicit ramp length
    pub fn set_volume_ramped(&self, layer: &str, volume: f32, ramp_secs: f64) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        let mut layers = self.layers.lock().unwrap();
        let node = self.ensure_locked(&mut layers, layer);
        let entry = layers.get_mut(layer).expect("layer just ensured");
        entry.volume = volume;
        entry.fade_gen += 1;
        drop(layers);

        self.schedule_ramp(node, volume, ramp_secs)
    }

    /// Logical volume of a layer (creates the layer on first reference)
    pub fn get_volume(&self, layer: &str) -> f32 {
        let mut layers = self.layers.lock().unwrap();
        self.ensure_locked(&mut layers, layer);
        layers.get(layer).map(|l| l.volume).unwrap_or(1.0)
    }

    /// Fade a layer to `target` over `duration_secs`
    ///
    /// `on_progress` fires at 20 Hz with the analytically computed current
    /// value (never read back from the node). Resolves `false` when a later
    /// volume operation supersedes the fade.
    pub async fn fade_volume(
        &self,
        layer: &str,
        target: f32,
        duration_secs: f64,
        on_progress: Option<FadeProgressFn>,
    ) -> bool {
        let target = target.clamp(0.0, 1.0);
        let (node, start, my_gen) = {
            let mut layers = self.layers.lock().unwrap();
            let node = self.ensure_locked(&mut layers, layer);
            let entry = layers.get_mut(layer).expect("layer just ensured");
            entry.fade_gen += 1;
            entry.volume = target;
            (node, self.host.backend().gain_value(node), entry.fade_gen)
        };

        if self.schedule_ramp(node, target, duration_secs).is_err() {
            return false;
        }

        if duration_secs <= 0.0 {
            if let Some(report) = &on_progress {
                report(layer, target, 1.0);
            }
            return true;
        }

        let ticks = ((duration_secs / FADE_TICK.as_secs_f64()).ceil() as u64).max(1);
        for tick in 1..=ticks {
            tokio::time::sleep(FADE_TICK).await;
            {
                let layers = self.layers.lock().unwrap();
                let current_gen = layers.get(layer).map(|l| l.fade_gen);
                if current_gen != Some(my_gen) {
                    debug!(layer, "fade superseded");
                    return false;
                }
            }
            let fraction = tick as f64 / ticks as f64;
            if let Some(report) = &on_progress {
                let value = start + (target - start) * fraction as f32;
                report(layer, value, fraction);
            }
        }
        true
    }

    /// Mute a layer, stashing the pre-mute volume
    ///
    /// Repeated mutes keep the original stash.
    pub fn mute(&self, layer: &str) -> Result<()> {
        {
            let mut layers = self.layers.lock().unwrap();
            self.ensure_locked(&mut layers, layer);
            let entry = layers.get_mut(layer).expect("layer just ensured");
            if entry.muted_from.is_none() {
                entry.muted_from = Some(entry.volume);
            }
            debug!(layer, previous = entry.volume, "muting layer");
        }
        self.set_volume(layer, 0.0)
    }

    /// Restore the stashed pre-mute volume and clear the stash
    pub fn unmute(&self, layer: &str) -> Result<()> {
        let restore = {
            let mut layers = self.layers.lock().unwrap();
            layers.get_mut(layer).and_then(|entry| entry.muted_from.take())
        };
        match restore {
            Some(volume) => self.set_volume(layer, volume),
            None => Ok(()),
        }
    }

    /// Whether a layer is currently muted
    pub fn is_muted(&self, layer: &str) -> bool {
        self.layers
            .lock()
            .unwrap()
            .get(layer)
            .map(|l| l.muted_from.is_some())
            .unwrap_or(false)
    }

    /// Wire `source → layer gain → mix bus`
    ///
    /// Re-asserts the gain's own edge to the mix bus, so a node coming back
    /// from a crossfade gets the layer's volume re-applied.
    pub fn connect_to_layer(&self, layer: &str, source: NodeId) -> Result<()> {
        let gain = self.layer_gain(layer);
        let backend = self.host.backend();
        backend.connect(source, gain)?;
        backend.connect(gain, self.host.mix_bus())?;
        Ok(())
    }

    /// Apply several volumes as one batch
    pub fn set_multiple(&self, volumes: &HashMap<String, f32>) -> Result<()> {
        // single lock scope so readers never observe a half-applied batch
        let mut pending = Vec::with_capacity(volumes.len());
        {
            let mut layers = self.layers.lock().unwrap();
            for (layer, volume) in volumes {
                let volume = volume.clamp(0.0, 1.0);
                let node = self.ensure_locked(&mut layers, layer);
                let entry = layers.get_mut(layer).expect("layer just ensured");
                entry.volume = volume;
                entry.fade_gen += 1;
                pending.push((node, volume));
            }
        }
        for (node, volume) in pending {
            self.schedule_ramp(node, volume, self.ramp_secs)?;
        }
        Ok(())
    }

    /// Layer names with a gain node
    pub fn layers(&self) -> Vec<String> {
        self.layers.lock().unwrap().keys().cloned().collect()
    }

    fn ensure_locked(&self, layers: &mut HashMap<String, LayerGain>, layer: &str) -> NodeId {
        if let Some(entry) = layers.get(layer) {
            return entry.node;
        }
        let backend = self.host.backend();
        let node = backend.create_gain(1.0);
        // wiring to the mix bus cannot fail for freshly created nodes
        let _ = backend.connect(node, self.host.mix_bus());
        debug!(layer, node, "created layer gain");
        layers.insert(
            layer.to_string(),
            LayerGain {
                node,
                volume: 1.0,
                muted_from: None,
                fade_gen: 0,
            },
        );
        node
    }

    /// Cancel outstanding automation and ramp to `target`
    fn schedule_ramp(&self, node: NodeId, target: f32, ramp_secs: f64) -> Result<()> {
        let backend = self.host.backend();
        let now = self.host.now();
        backend.cancel_ramps(node)?;
        if ramp_secs <= 0.0 {
            backend.set_gain_at(node, target, now)?;
        } else {
            let current = backend.gain_value(node);
            backend.set_gain_at(node, current, now)?;
            backend.ramp_gain_to(node, target, now + ramp_secs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{AudioBackend, MockBackend};

    fn setup() -> (Arc<MockBackend>, Arc<VolumeController>) {
        let backend = Arc::new(MockBackend::new());
        let host = AudioHost::initialize(
            backend.clone() as Arc<dyn crate::host::AudioBackend>,
            0.01,
            false,
        )
        .unwrap();
        let volume = VolumeController::new(host, 0.01);
        (backend, volume)
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_volume_clamps_and_ramps() {
        let (backend, volume) = setup();
        volume.set_volume("drone", 1.8).unwrap();
        assert_eq!(volume.get_volume("drone"), 1.0);

        volume.set_volume("drone", 0.3).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let node = volume.layer_gain("drone");
        assert!((backend.gain_value(node) - 0.3).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_reports_analytic_progress() {
        let (_, volume) = setup();
        volume.set_volume_ramped("drone", 0.0, 0.0).unwrap();

        let seen: Arc<Mutex<Vec<(f32, f64)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let done = volume
            .fade_volume(
                "drone",
                1.0,
                1.0,
                Some(Arc::new(move |_, value, fraction| {
                    seen_in.lock().unwrap().push((value, fraction));
                })),
            )
            .await;
        assert!(done);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        let (value, fraction) = seen[9];
        assert!((fraction - 0.5).abs() < 1e-9);
        assert!((value - 0.5).abs() < 0.01);
        let (last_value, last_fraction) = *seen.last().unwrap();
        assert_eq!(last_fraction, 1.0);
        assert!((last_value - 1.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fade_superseded_by_set_resolves_false() {
        let (_, volume) = setup();
        let controller = Arc::clone(&volume);
        let fade = tokio::spawn(async move {
            controller.fade_volume("drone", 0.0, 2.0, None).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        volume.set_volume("drone", 0.9).unwrap();

        assert!(!fade.await.unwrap());
        assert_eq!(volume.get_volume("drone"), 0.9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_unmute_restores_stash() {
        let (_, volume) = setup();
        volume.set_volume("drone", 0.7).unwrap();

        volume.mute("drone").unwrap();
        assert!(volume.is_muted("drone"));
        assert_eq!(volume.get_volume("drone"), 0.0);

        // second mute keeps the original stash
        volume.mute("drone").unwrap();

        volume.unmute("drone").unwrap();
        assert!(!volume.is_muted("drone"));
        assert_eq!(volume.get_volume("drone"), 0.7);

        // unmute without mute is a no-op
        volume.unmute("drone").unwrap();
        assert_eq!(volume.get_volume("drone"), 0.7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_layer_builds_full_path() {
        let (backend, volume) = setup();
        volume.set_volume_ramped("drone", 0.5, 0.0).unwrap();

        let buffer = Arc::new(crate::audio::PcmBuffer {
            samples: vec![0.5; 2000],
            sample_rate: 44_100,
            source_channels: 2,
            source_sample_rate: 44_100,
        });
        let source = backend.create_source(buffer);
        volume.connect_to_layer("drone", source).unwrap();

        // source → layer gain (0.5) → master (1.0) → destination
        assert!((backend.path_gain(source) - 0.5).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_multiple() {
        let (_, volume) = setup();
        let batch = HashMap::from([
            ("drone".to_string(), 0.2f32),
            ("melody".to_string(), 0.8f32),
        ]);
        volume.set_multiple(&batch).unwrap();
        assert_eq!(volume.get_volume("drone"), 0.2);
        assert_eq!(volume.get_volume("melody"), 0.8);
    }
}
