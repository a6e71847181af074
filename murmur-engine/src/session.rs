//! Session engine facade
//!
//! Assembles the component DAG (host → volume controller and buffer cache
//! → crossfade engine → layer manager → phase controller → timeline) and
//! exposes the embedder-facing surface: collection loading, playback
//! control, the preset state surface and the event bus.

use crate::cache::BufferCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::host::{AudioBackend, AudioHost};
use crate::model::{prepare_collection, Collection};
use crate::net::Transport;
use crate::playback::{
    AddEvent, CrossfadeEngine, LayerManager, PhaseController, TickPace, Timeline, VolumeController,
};
use crate::state::{StateProviderFn, StateProviders};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// The assembled session engine
pub struct SessionEngine {
    config: EngineConfig,
    host: Arc<AudioHost>,
    cache: Arc<BufferCache>,
    volume: Arc<VolumeController>,
    crossfade: Arc<CrossfadeEngine>,
    layers: Arc<LayerManager>,
    phases: Arc<PhaseController>,
    timeline: Arc<Timeline>,
    bus: EventBus,
    providers: StateProviders,
    collection: Mutex<Option<Collection>>,
}

impl SessionEngine {
    /// Build the engine against an audio backend and a byte transport
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let bus = EventBus::new(1024);

        let host = AudioHost::initialize(
            backend,
            config.volume_ramp_secs,
            config.auto_resume_on_interaction,
        )?;
        let cache = BufferCache::new(
            transport,
            bus.clone(),
            config.max_cache_entries,
            config.working_sample_rate,
            config.preload_concurrency,
        );
        let volume = VolumeController::new(Arc::clone(&host), config.volume_ramp_secs);
        let crossfade = CrossfadeEngine::new(
            Arc::clone(&host),
            Arc::clone(&volume),
            config.min_fade_secs,
            config.max_fade_secs,
        );
        let layers = LayerManager::new(
            Arc::clone(&host),
            Arc::clone(&cache),
            Arc::clone(&volume),
            Arc::clone(&crossfade),
        );
        let pace = Arc::new(TickPace::new(
            config.progress_tick(),
            config.high_freq_tick(),
        ));
        let phases = PhaseController::new(
            Arc::clone(&volume),
            Arc::clone(&layers),
            bus.clone(),
            Arc::clone(&pace),
            config.default_transition_duration_ms,
        );
        let timeline = Timeline::new(Arc::clone(&phases), bus.clone(), pace, &config);

        info!("session engine assembled");
        Ok(Arc::new(Self {
            config,
            host,
            cache,
            volume,
            crossfade,
            layers,
            phases,
            timeline,
            bus,
            providers: StateProviders::new(),
            collection: Mutex::new(None),
        }))
    }

    /// Load a collection: repair it, register layers and phases, apply the
    /// initial phase state
    pub async fn load_collection(&self, collection: Collection) -> Result<()> {
        let collection = prepare_collection(collection);

        self.timeline
            .set_session_duration(if collection.session_duration_ms > 0 {
                collection.session_duration_ms
            } else {
                self.config.default_session_duration_ms
            })?;
        self.timeline
            .set_transition_duration(collection.transition_duration_ms);
        self.phases.set_phases(collection.phases.clone());
        self.layers.register_collection(&collection).await?;

        info!(collection = %collection.id, "collection loaded");
        *self.collection.lock().unwrap() = Some(collection);
        Ok(())
    }

    /// Warm the cache with every audio URL in the loaded collection
    ///
    /// The engine never preloads on its own; call this when it suits the
    /// embedder (e.g. right after `load_collection`).
    pub async fn preload_collection(
        &self,
        on_progress: Option<crate::cache::PreloadProgressFn>,
    ) -> usize {
        let urls = {
            let collection = self.collection.lock().unwrap();
            collection.as_ref().map(|c| c.audio_urls()).unwrap_or_default()
        };
        self.cache.preload(&urls, None, on_progress).await.len()
    }

    // ---- playback control ----

    /// Start the session; `reset` restarts from zero
    ///
    /// Refuses with [`EngineError::Busy`] while the output is suspended.
    pub fn start(&self, reset: bool) -> Result<()> {
        if self.host.is_suspended() {
            return Err(EngineError::Busy(
                "audio output is suspended; resume it first".into(),
            ));
        }
        self.timeline.start(reset);
        Ok(())
    }

    pub fn pause(&self) {
        self.timeline.pause();
    }

    pub fn resume_playback(&self) {
        self.timeline.resume();
    }

    pub fn stop(&self) {
        self.timeline.stop();
    }

    pub fn reset(&self) {
        self.timeline.reset();
    }

    pub fn seek_ms(&self, position_ms: u64) {
        self.timeline.seek_ms(position_ms);
    }

    pub fn seek_percent(&self, percent: f64) {
        self.timeline.seek_percent(percent);
    }

    pub fn set_session_duration(&self, duration_ms: u64) -> Result<()> {
        self.timeline.set_session_duration(duration_ms)
    }

    pub fn set_transition_duration(&self, duration_ms: u64) {
        self.timeline.set_transition_duration(duration_ms);
    }

    pub fn add_event(&self, event: AddEvent) -> Result<()> {
        self.timeline.add_event(event)
    }

    /// Manually trigger a phase by id
    pub fn trigger_phase(&self, phase_id: &str, immediate: bool) -> bool {
        self.phases.trigger_phase(phase_id, immediate)
    }

    pub fn set_master_volume(&self, level: f32) {
        self.host.set_master_volume(level);
    }

    /// Resume the audio output (host-level, not the timeline)
    ///
    /// A failure that survives the host's retry is fatal for the session
    /// and also surfaces on the event bus.
    pub async fn resume_output(&self) -> Result<()> {
        self.host.resume().await.inspect_err(|error| {
            self.bus.emit_lossy(EngineEvent::BufferError {
                url: String::new(),
                kind: "host".into(),
                message: error.to_string(),
                timestamp: EngineEvent::now(),
            });
        })
    }

    /// Suspend the audio output; pauses the timeline first
    ///
    /// As with [`SessionEngine::resume_output`], a failure that survives
    /// the host's retry also surfaces on the event bus.
    pub async fn suspend_output(&self) -> Result<()> {
        self.timeline.pause();
        self.host.suspend().await.inspect_err(|error| {
            self.bus.emit_lossy(EngineEvent::BufferError {
                url: String::new(),
                kind: "host".into(),
                message: error.to_string(),
                timestamp: EngineEvent::now(),
            });
        })
    }

    /// Signal a user interaction (may auto-resume the output)
    pub async fn user_interaction(&self) -> Result<()> {
        self.host.user_interaction().await
    }

    /// Tear the engine down: stop playback, drop nodes, suspend output
    pub fn teardown(&self) {
        self.timeline.stop();
        self.layers.clear();
        self.cache.clear();
        self.host.teardown();
        info!("session engine torn down");
    }

    // ---- surfaces ----

    /// Subscribe to engine events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Register a preset state provider
    pub fn register_state_provider(&self, id: &str, provider: StateProviderFn) {
        self.providers.register(id, provider);
    }

    /// Full preset state: phases, timestamp and every provider fragment
    pub fn full_state(&self) -> Value {
        self.providers.full_state(&self.phases.phases())
    }

    // ---- component access ----

    pub fn host(&self) -> &Arc<AudioHost> {
        &self.host
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn volume(&self) -> &Arc<VolumeController> {
        &self.volume
    }

    pub fn crossfade(&self) -> &Arc<CrossfadeEngine> {
        &self.crossfade
    }

    pub fn layers(&self) -> &Arc<LayerManager> {
        &self.layers
    }

    pub fn phase_controller(&self) -> &Arc<PhaseController> {
        &self.phases
    }

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    /// Block until playback finishes or is stopped externally
    ///
    /// Convenience for headless embedders: waits for the session-ended
    /// event, polling playback state as a fallback for external stops.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(EngineEvent::SessionEnded { .. }) => return,
                    Ok(_) => {}
                    Err(_) => return,
                },
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if !self.timeline.is_playing() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockBackend;
    use crate::net::MemoryTransport;

    fn engine() -> Arc<SessionEngine> {
        SessionEngine::new(
            Arc::new(MockBackend::new()),
            Arc::new(MemoryTransport::new().build()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refused_while_suspended() {
        let engine = engine();
        engine.host().backend().suspend().unwrap();

        match engine.start(true) {
            Err(EngineError::Busy(_)) => {}
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }

        engine.resume_output().await.unwrap();
        engine.start(true).unwrap();
        assert!(engine.timeline().is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_includes_providers() {
        let engine = engine();
        engine.register_state_provider("marker", Box::new(|| serde_json::json!({"set": true})));

        let state = engine.full_state();
        assert_eq!(state["marker"]["set"], true);
        assert!(state["phases"].is_array());
    }
}
