//! Phase transition controller
//!
//! Owns the authoritative phase list and applies captured phase state to
//! the live audio graph. Overlapping transition requests serialise through
//! a queue: completion of the running transition dequeues and starts the
//! next, so the complete-before-next-start ordering holds for observers.
//! While any transition is active the timeline ticks at its high-frequency
//! rate via the shared [`TickPace`].

use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::model::{PhaseMarker, PhaseState};
use crate::playback::{LayerManager, TickPace, VolumeController};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settle margin added to a transition before declaring it complete (ms)
const SETTLE_MS: u64 = 50;

/// Switch duration used when a phase is applied without crossfade (ms);
/// short enough to feel instant, long enough to avoid pops
const IMMEDIATE_SWITCH_MS: u64 = 50;

struct ActiveTransition {
    gen: u64,
    phase_id: String,
}

struct Queued {
    phase_id: String,
    duration_ms: u64,
}

struct PhaseInner {
    phases: Vec<PhaseMarker>,
    selected: Option<String>,
    active: Option<ActiveTransition>,
    queue: VecDeque<Queued>,
    gen: u64,
}

/// Phase transition controller
pub struct PhaseController {
    volume: Arc<VolumeController>,
    layers: Arc<LayerManager>,
    bus: EventBus,
    pace: Arc<TickPace>,
    inner: Mutex<PhaseInner>,
    default_transition_ms: AtomicU64,
}

impl PhaseController {
    pub fn new(
        volume: Arc<VolumeController>,
        layers: Arc<LayerManager>,
        bus: EventBus,
        pace: Arc<TickPace>,
        default_transition_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            volume,
            layers,
            bus,
            pace,
            inner: Mutex::new(PhaseInner {
                phases: Vec::new(),
                selected: None,
                active: None,
                queue: VecDeque::new(),
                gen: 0,
            }),
            default_transition_ms: AtomicU64::new(default_transition_ms),
        })
    }

    /// Replace the phase list (collection load)
    pub fn set_phases(&self, phases: Vec<PhaseMarker>) {
        let mut inner = self.inner.lock().unwrap();
        inner.phases = phases;
        inner.selected = None;
        inner.queue.clear();
        inner.active = None;
    }

    /// Snapshot of the phase list
    pub fn phases(&self) -> Vec<PhaseMarker> {
        self.inner.lock().unwrap().phases.clone()
    }

    /// One phase by id
    pub fn phase(&self, phase_id: &str) -> Option<PhaseMarker> {
        self.inner
            .lock()
            .unwrap()
            .phases
            .iter()
            .find(|p| p.id == phase_id)
            .cloned()
    }

    /// The phase governing `progress` percent: the last marker at or before
    /// it, or the first marker when none is
    pub fn phase_at(&self, progress: f64) -> Option<PhaseMarker> {
        let inner = self.inner.lock().unwrap();
        inner
            .phases
            .iter()
            .rev()
            .find(|p| p.position <= progress)
            .or_else(|| inner.phases.first())
            .cloned()
    }

    pub fn set_default_transition_ms(&self, duration_ms: u64) {
        self.default_transition_ms
            .store(duration_ms, Ordering::Relaxed);
    }

    /// Whether a transition is currently applying
    pub fn is_transition_active(&self) -> bool {
        self.inner.lock().unwrap().active.is_some()
    }

    /// Begin (or enqueue) a transition to a phase
    ///
    /// Returns `false` for an unknown phase. With a transition already
    /// active and `immediate` false, the request queues and runs after the
    /// active one completes. `immediate` jumps the queue, closing the
    /// running transition first.
    pub fn start_transition(
        self: &Arc<Self>,
        phase_id: &str,
        duration_ms: Option<u64>,
        immediate: bool,
    ) -> bool {
        let Some(phase) = self.phase(phase_id) else {
            warn!(phase_id, "transition requested for unknown phase");
            return false;
        };
        let duration_ms =
            duration_ms.unwrap_or_else(|| self.default_transition_ms.load(Ordering::Relaxed));

        let replaced = {
            let mut inner = self.inner.lock().unwrap();
            if inner.active.is_some() && !immediate {
                debug!(phase_id, "transition queued behind active one");
                inner.queue.push_back(Queued {
                    phase_id: phase_id.to_string(),
                    duration_ms,
                });
                return true;
            }
            inner.active.take()
        };
        if let Some(old) = replaced {
            // Immediate takeover closes the superseded transition before
            // the new one starts, preserving complete-before-start order.
            self.bus.emit_lossy(EngineEvent::TransitionCompleted {
                phase_id: old.phase_id,
                timestamp: EngineEvent::now(),
            });
        }

        self.begin(phase, duration_ms, false);
        true
    }

    /// Manually trigger a phase
    ///
    /// With `immediate`, volumes apply at once and track switches use a
    /// 50 ms anti-pop fade instead of the configured crossfade.
    pub fn trigger_phase(self: &Arc<Self>, phase_id: &str, immediate: bool) -> bool {
        if !immediate {
            return self.start_transition(phase_id, None, false);
        }

        let Some(phase) = self.phase(phase_id) else {
            warn!(phase_id, "trigger requested for unknown phase");
            return false;
        };
        let replaced = self.inner.lock().unwrap().active.take();
        if let Some(old) = replaced {
            self.bus.emit_lossy(EngineEvent::TransitionCompleted {
                phase_id: old.phase_id,
                timestamp: EngineEvent::now(),
            });
        }
        self.begin(phase, IMMEDIATE_SWITCH_MS, true);
        true
    }

    /// Apply the pre-onset phase (or the first phase) without transition
    /// machinery: instant volumes, anti-pop switches, no transition events
    pub fn apply_pre_onset(self: &Arc<Self>) -> bool {
        let phase = {
            let inner = self.inner.lock().unwrap();
            inner
                .phases
                .iter()
                .find(|p| p.id == "pre-onset")
                .or_else(|| inner.phases.first())
                .cloned()
        };
        let Some(phase) = phase else {
            return false;
        };
        let Some(state) = phase.state.clone() else {
            return false;
        };
        info!(phase = %phase.id, "applying pre-onset phase state");
        self.dispatch(&state, IMMEDIATE_SWITCH_MS, true);
        true
    }

    /// Cancel the active transition and drop the queue
    pub fn cancel_all(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.clear();
            inner.active = None;
            inner.gen += 1;
        }
        self.layers.cancel_all();
        self.pace.set_high(false);
        debug!("transitions cancelled and queue dropped");
    }

    // ---- marker editing ----

    pub fn select_marker(&self, phase_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.phases.iter().any(|p| p.id == phase_id) {
            return Err(EngineError::NotFound {
                kind: "phase",
                id: phase_id.to_string(),
            });
        }
        inner.selected = Some(phase_id.to_string());
        Ok(())
    }

    pub fn deselect_marker(&self) {
        self.inner.lock().unwrap().selected = None;
    }

    pub fn selected_marker(&self) -> Option<String> {
        self.inner.lock().unwrap().selected.clone()
    }

    /// Move a marker, clamped between its neighbours
    ///
    /// Locked markers and the first marker (pinned at 0) refuse the move.
    /// Returns the clamped position actually applied.
    pub fn move_marker(&self, phase_id: &str, new_position: f64) -> Result<f64> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .phases
            .iter()
            .position(|p| p.id == phase_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "phase",
                id: phase_id.to_string(),
            })?;

        if inner.phases[index].locked {
            return Err(EngineError::Invalid(format!(
                "marker {phase_id} is locked"
            )));
        }
        if index == 0 {
            return Err(EngineError::Invalid(
                "first marker is pinned to position 0".into(),
            ));
        }

        let left = inner.phases[index - 1].position + 1.0;
        let right = inner
            .phases
            .get(index + 1)
            .map(|p| p.position - 1.0)
            .unwrap_or(100.0);
        if left > right {
            return Err(EngineError::Invalid(format!(
                "no room between neighbours ({left} > {right})"
            )));
        }

        let clamped = new_position.clamp(left, right);
        inner.phases[index].position = clamped;
        inner
            .phases
            .sort_by(|a, b| a.position.partial_cmp(&b.position).unwrap_or(std::cmp::Ordering::Equal));
        debug!(phase_id, position = clamped, "marker moved");
        Ok(clamped)
    }

    // ---- internals ----

    /// Mark a transition active, fire its start event, dispatch the state
    /// diff and arm the completion driver
    fn begin(self: &Arc<Self>, phase: PhaseMarker, duration_ms: u64, instant: bool) {
        let gen = {
            let mut inner = self.inner.lock().unwrap();
            inner.gen += 1;
            inner.active = Some(ActiveTransition {
                gen: inner.gen,
                phase_id: phase.id.clone(),
            });
            inner.gen
        };

        self.pace.set_high(true);
        info!(phase = %phase.id, duration_ms, instant, "transition started");
        self.bus.emit_lossy(EngineEvent::TransitionStarted {
            phase_id: phase.id.clone(),
            duration_ms,
            timestamp: EngineEvent::now(),
        });

        if let Some(state) = &phase.state {
            self.dispatch(state, duration_ms, instant);
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(duration_ms + SETTLE_MS)).await;
            controller.complete(gen);
        });
    }

    /// Diff the captured state against the live state and spawn the work
    fn dispatch(self: &Arc<Self>, state: &PhaseState, duration_ms: u64, instant: bool) {
        for (layer, &target) in &state.volumes {
            if instant {
                if let Err(error) = self.volume.set_volume(layer, target) {
                    warn!(layer, %error, "instant volume apply failed");
                }
            } else {
                let volume = Arc::clone(&self.volume);
                let layer = layer.clone();
                let duration_secs = duration_ms as f64 / 1000.0;
                tokio::spawn(async move {
                    volume.fade_volume(&layer, target, duration_secs, None).await;
                });
            }
        }

        for (layer, track) in &state.active_audio {
            if self.layers.active_track(layer).as_deref() == Some(track.as_str()) {
                continue;
            }
            let switch_ms = if instant { IMMEDIATE_SWITCH_MS } else { duration_ms };
            let layers = Arc::clone(&self.layers);
            let layer = layer.clone();
            let track = track.clone();
            tokio::spawn(async move {
                match layers.switch_to(&layer, &track, switch_ms).await {
                    Ok(true) => {}
                    Ok(false) => debug!(layer, track, "switch superseded during transition"),
                    Err(error) => warn!(layer, track, %error, "switch failed during transition"),
                }
            });
        }
    }

    /// Close a transition and chain into the queue
    fn complete(self: &Arc<Self>, gen: u64) {
        let (phase_id, next) = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.active {
                Some(active) if active.gen == gen => {
                    let phase_id = inner.active.take().expect("checked above").phase_id;
                    let next = inner.queue.pop_front();
                    (phase_id, next)
                }
                _ => return, // superseded or cancelled
            }
        };

        info!(phase = %phase_id, "transition complete");
        self.bus.emit_lossy(EngineEvent::TransitionCompleted {
            phase_id,
            timestamp: EngineEvent::now(),
        });

        match next {
            Some(queued) => match self.phase(&queued.phase_id) {
                Some(phase) => self.begin(phase, queued.duration_ms, false),
                None => {
                    warn!(phase_id = %queued.phase_id, "queued phase vanished");
                    self.pace.set_high(false);
                }
            },
            None => self.pace.set_high(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferCache;
    use crate::host::{AudioBackend, AudioHost, MockBackend};
    use crate::net::MemoryTransport;
    use crate::playback::CrossfadeEngine;
    use std::collections::HashMap;

    fn marker(id: &str, position: f64, locked: bool) -> PhaseMarker {
        PhaseMarker {
            id: id.into(),
            name: id.into(),
            position,
            color: String::new(),
            locked,
            state: Some(PhaseState {
                volumes: HashMap::from([("drone".to_string(), position as f32 / 100.0)]),
                active_audio: HashMap::new(),
            }),
        }
    }

    fn setup() -> Arc<PhaseController> {
        let backend = Arc::new(MockBackend::new());
        let host = AudioHost::initialize(
            backend as Arc<dyn AudioBackend>,
            0.01,
            false,
        )
        .unwrap();
        let cache = BufferCache::new(
            Arc::new(MemoryTransport::new().build()),
            EventBus::new(64),
            8,
            44_100,
            3,
        );
        let volume = VolumeController::new(Arc::clone(&host), 0.01);
        let crossfade = CrossfadeEngine::new(Arc::clone(&host), Arc::clone(&volume), 0.05, 30.0);
        let layers = LayerManager::new(host, cache, Arc::clone(&volume), crossfade);
        let pace = Arc::new(TickPace::new(
            Duration::from_millis(250),
            Duration::from_millis(50),
        ));
        PhaseController::new(volume, layers, EventBus::new(64), pace, 1_000)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_phase_returns_false() {
        let controller = setup();
        assert!(!controller.start_transition("ghost", None, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_start_and_complete_events() {
        let controller = setup();
        controller.set_phases(vec![marker("onset", 20.0, false)]);
        let mut rx = controller.bus.subscribe();

        assert!(controller.start_transition("onset", Some(500), false));
        assert!(controller.is_transition_active());
        assert!(controller.pace.is_high());

        match rx.recv().await.unwrap() {
            EngineEvent::TransitionStarted { phase_id, duration_ms, .. } => {
                assert_eq!(phase_id, "onset");
                assert_eq!(duration_ms, 500);
            }
            other => panic!("wrong event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        match rx.recv().await.unwrap() {
            EngineEvent::TransitionCompleted { phase_id, .. } => assert_eq!(phase_id, "onset"),
            other => panic!("wrong event: {other:?}"),
        }
        assert!(!controller.is_transition_active());
        assert!(!controller.pace.is_high());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_serialises_transitions() {
        let controller = setup();
        controller.set_phases(vec![
            marker("onset", 20.0, false),
            marker("peak", 40.0, false),
            marker("return", 60.0, false),
        ]);
        let mut rx = controller.bus.subscribe();

        assert!(controller.start_transition("onset", Some(300), false));
        assert!(controller.start_transition("peak", Some(300), false));
        assert!(controller.start_transition("return", Some(300), false));

        tokio::time::sleep(Duration::from_millis(2_000)).await;

        let mut order = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::TransitionStarted { phase_id, .. } => {
                    order.push(format!("start:{phase_id}"))
                }
                EngineEvent::TransitionCompleted { phase_id, .. } => {
                    order.push(format!("complete:{phase_id}"))
                }
                _ => {}
            }
        }
        assert_eq!(
            order,
            vec![
                "start:onset",
                "complete:onset",
                "start:peak",
                "complete:peak",
                "start:return",
                "complete:return",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_queue() {
        let controller = setup();
        controller.set_phases(vec![marker("onset", 20.0, false), marker("peak", 40.0, false)]);

        controller.start_transition("onset", Some(500), false);
        controller.start_transition("peak", Some(500), false);
        controller.cancel_all();

        assert!(!controller.is_transition_active());
        assert!(!controller.pace.is_high());

        // the armed driver must not resurrect the queue
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!controller.is_transition_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_at_picks_last_at_or_before() {
        let controller = setup();
        controller.set_phases(vec![
            marker("pre-onset", 0.0, false),
            marker("onset", 20.0, false),
            marker("peak", 40.0, false),
        ]);

        assert_eq!(controller.phase_at(0.0).unwrap().id, "pre-onset");
        assert_eq!(controller.phase_at(19.9).unwrap().id, "pre-onset");
        assert_eq!(controller.phase_at(20.0).unwrap().id, "onset");
        assert_eq!(controller.phase_at(99.0).unwrap().id, "peak");
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_marker_clamps_between_neighbours() {
        let controller = setup();
        controller.set_phases(vec![
            marker("a", 0.0, false),
            marker("b", 20.0, false),
            marker("c", 40.0, false),
        ]);

        // clamped into (left+1, right-1)
        assert_eq!(controller.move_marker("b", 95.0).unwrap(), 39.0);
        assert_eq!(controller.move_marker("b", -10.0).unwrap(), 1.0);
        // in-range move applies exactly
        assert_eq!(controller.move_marker("b", 25.0).unwrap(), 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_marker_rejects_locked_and_first() {
        let controller = setup();
        controller.set_phases(vec![
            marker("a", 0.0, false),
            marker("b", 20.0, true),
            marker("c", 40.0, false),
        ]);

        assert!(matches!(
            controller.move_marker("b", 30.0),
            Err(EngineError::Invalid(_))
        ));
        assert!(matches!(
            controller.move_marker("a", 10.0),
            Err(EngineError::Invalid(_))
        ));
        assert!(matches!(
            controller.move_marker("ghost", 10.0),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_selection() {
        let controller = setup();
        controller.set_phases(vec![marker("a", 0.0, false)]);

        assert!(controller.select_marker("a").is_ok());
        assert_eq!(controller.selected_marker().as_deref(), Some("a"));
        controller.deselect_marker();
        assert_eq!(controller.selected_marker(), None);
        assert!(controller.select_marker("ghost").is_err());
    }
}
