//! Timeline scheduler
//!
//! Owns session time: elapsed, playing state, session/transition durations,
//! scheduled events and the current phase. Two tickers run while playing: a
//! progress ticker (normal rate, or high-frequency while a transition is
//! active) that emits progress and re-evaluates the active phase, and an
//! event ticker that fires scheduled events whose time has come, in order,
//! one at a time.
//!
//! Elapsed time is derived, not accumulated: while playing it is the stored
//! base plus time since the last start/resume/seek, so pause/resume
//! preserves position exactly.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::playback::{PhaseController, TickPace};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A scheduled one-shot timeline event
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub id: String,

    /// Absolute session time (ms)
    pub time_ms: u64,

    /// Opaque caller payload, echoed in the fired event
    pub payload: Option<serde_json::Value>,

    /// Set once fired; cleared by `reset`
    fired: bool,
}

/// Input for [`Timeline::add_event`]
#[derive(Debug, Clone, Default)]
pub struct AddEvent {
    pub id: String,

    /// Absolute session time (ms); exclusive with `position`
    pub time_ms: Option<u64>,

    /// Percent of session duration; converted to time at insertion
    pub position: Option<f64>,

    pub payload: Option<serde_json::Value>,
}

struct TimelineState {
    session_duration_ms: u64,
    transition_duration_ms: u64,
    /// Elapsed base (ms); authoritative while paused
    elapsed_ms: u64,
    /// Set while playing; elapsed = base + time since this instant
    started_at: Option<Instant>,
    playing: bool,
    events: Vec<ScheduledEvent>,
    next_event_index: usize,
    current_phase: Option<String>,
    /// Bumped to orphan running ticker tasks
    run_gen: u64,
}

impl TimelineState {
    fn elapsed_now(&self) -> u64 {
        let base = self.elapsed_ms;
        match self.started_at {
            Some(started) if self.playing => {
                (base + started.elapsed().as_millis() as u64).min(self.session_duration_ms)
            }
            _ => base,
        }
    }

    fn progress_now(&self) -> f64 {
        if self.session_duration_ms == 0 {
            return 0.0;
        }
        (self.elapsed_now() as f64 / self.session_duration_ms as f64 * 100.0).min(100.0)
    }
}

/// Timeline scheduler
pub struct Timeline {
    phases: Arc<PhaseController>,
    bus: EventBus,
    pace: Arc<TickPace>,
    state: Arc<Mutex<TimelineState>>,
    event_tick: std::time::Duration,
}

impl Timeline {
    pub fn new(
        phases: Arc<PhaseController>,
        bus: EventBus,
        pace: Arc<TickPace>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            phases,
            bus,
            pace,
            state: Arc::new(Mutex::new(TimelineState {
                session_duration_ms: config.default_session_duration_ms,
                transition_duration_ms: config.default_transition_duration_ms,
                elapsed_ms: 0,
                started_at: None,
                playing: false,
                events: Vec::new(),
                next_event_index: 0,
                current_phase: None,
                run_gen: 0,
            })),
            event_tick: config.event_tick(),
        })
    }

    // ---- lifecycle ----

    /// Start playback
    ///
    /// With `reset`, elapsed, the event cursor and the current phase are
    /// cleared first and a zero progress event fires.
    pub fn start(self: &Arc<Self>, reset: bool) {
        let gen = {
            let mut state = self.state.lock().unwrap();
            if reset {
                state.elapsed_ms = 0;
                state.next_event_index = 0;
                state.current_phase = None;
                for event in &mut state.events {
                    event.fired = false;
                }
            } else if state.playing {
                return;
            }
            state.playing = true;
            state.started_at = Some(Instant::now());
            state.run_gen += 1;
            state.run_gen
        };

        info!(reset, "timeline started");
        if reset {
            self.emit_progress();
        }
        self.bus.emit_lossy(EngineEvent::PlaybackStateChanged {
            playing: true,
            timestamp: EngineEvent::now(),
        });
        self.check_current_phase();
        self.spawn_tickers(gen);
    }

    /// Freeze elapsed and stop the tickers
    pub fn pause(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.playing {
                return;
            }
            state.elapsed_ms = state.elapsed_now();
            state.started_at = None;
            state.playing = false;
            state.run_gen += 1;
        }
        info!("timeline paused");
        self.bus.emit_lossy(EngineEvent::PlaybackStateChanged {
            playing: false,
            timestamp: EngineEvent::now(),
        });
    }

    /// Resume from the frozen elapsed position
    pub fn resume(self: &Arc<Self>) {
        self.start(false);
    }

    /// Pause and cancel all transitions and crossfades
    pub fn stop(&self) {
        self.pause();
        self.phases.cancel_all();
        info!("timeline stopped");
    }

    /// Stop, zero the session and re-apply the pre-onset phase
    pub fn reset(&self) {
        self.stop();
        {
            let mut state = self.state.lock().unwrap();
            state.elapsed_ms = 0;
            state.next_event_index = 0;
            state.current_phase = None;
            for event in &mut state.events {
                event.fired = false;
            }
        }
        self.emit_progress();
        self.phases.apply_pre_onset();
        info!("timeline reset");
    }

    // ---- position ----

    /// Seek to an absolute session time (ms), clamped into the session
    pub fn seek_ms(self: &Arc<Self>, position_ms: u64) {
        {
            let mut state = self.state.lock().unwrap();
            let clamped = position_ms.min(state.session_duration_ms);
            state.elapsed_ms = clamped;
            if state.playing {
                state.started_at = Some(Instant::now());
            }
            debug!(elapsed_ms = clamped, "seek");
        }
        self.emit_progress();
        self.check_current_phase();
    }

    /// Seek to a percent of the session
    pub fn seek_percent(self: &Arc<Self>, percent: f64) {
        let target = {
            let state = self.state.lock().unwrap();
            (percent.clamp(0.0, 100.0) / 100.0 * state.session_duration_ms as f64) as u64
        };
        self.seek_ms(target);
    }

    // ---- configuration ----

    /// Change the session duration; phase boundaries move with it
    pub fn set_session_duration(self: &Arc<Self>, duration_ms: u64) -> Result<()> {
        if duration_ms == 0 {
            return Err(EngineError::Invalid(
                "session duration must be greater than zero".into(),
            ));
        }
        {
            let mut state = self.state.lock().unwrap();
            state.session_duration_ms = duration_ms;
            if state.elapsed_ms > duration_ms {
                state.elapsed_ms = duration_ms;
            }
        }
        self.check_current_phase();
        Ok(())
    }

    /// Default transition duration fed into phase-boundary transitions
    pub fn set_transition_duration(&self, duration_ms: u64) {
        self.state.lock().unwrap().transition_duration_ms = duration_ms;
        self.phases.set_default_transition_ms(duration_ms);
    }

    // ---- scheduled events ----

    /// Insert a scheduled event, keeping time order (ties by insertion)
    pub fn add_event(&self, event: AddEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.events.iter().any(|e| e.id == event.id) {
            return Err(EngineError::Invalid(format!(
                "duplicate event id: {}",
                event.id
            )));
        }
        let time_ms = match (event.time_ms, event.position) {
            (Some(time), _) => time,
            (None, Some(position)) => {
                if !(0.0..=100.0).contains(&position) {
                    return Err(EngineError::Invalid(format!(
                        "event position {position} outside [0, 100]"
                    )));
                }
                (position / 100.0 * state.session_duration_ms as f64) as u64
            }
            (None, None) => {
                return Err(EngineError::Invalid(
                    "event needs either a time or a position".into(),
                ));
            }
        };

        let index = state.events.partition_point(|e| e.time_ms <= time_ms);
        state.events.insert(
            index,
            ScheduledEvent {
                id: event.id,
                time_ms,
                payload: event.payload,
                fired: false,
            },
        );
        // An event inserted behind the cursor must still get its turn;
        // fired flags keep already-fired ones from repeating.
        if index < state.next_event_index {
            state.next_event_index = index;
        }
        Ok(())
    }

    /// Snapshot of the scheduled events
    pub fn events(&self) -> Vec<(String, u64, bool)> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|e| (e.id.clone(), e.time_ms, e.fired))
            .collect()
    }

    // ---- queries ----

    pub fn elapsed_ms(&self) -> u64 {
        self.state.lock().unwrap().elapsed_now()
    }

    pub fn progress_percent(&self) -> f64 {
        self.state.lock().unwrap().progress_now()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub fn session_duration_ms(&self) -> u64 {
        self.state.lock().unwrap().session_duration_ms
    }

    pub fn transition_duration_ms(&self) -> u64 {
        self.state.lock().unwrap().transition_duration_ms
    }

    pub fn current_phase(&self) -> Option<String> {
        self.state.lock().unwrap().current_phase.clone()
    }

    // ---- internals ----

    /// Re-evaluate the active phase and start a transition on change
    ///
    /// The stored current phase updates before the change event fires.
    pub fn check_current_phase(self: &Arc<Self>) {
        let (progress, transition_ms) = {
            let state = self.state.lock().unwrap();
            (state.progress_now(), state.transition_duration_ms)
        };
        let Some(marker) = self.phases.phase_at(progress) else {
            return;
        };

        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.current_phase.as_deref() != Some(marker.id.as_str()) {
                state.current_phase = Some(marker.id.clone());
                true
            } else {
                false
            }
        };
        if !changed {
            return;
        }

        info!(phase = %marker.id, progress, "phase changed");
        self.bus.emit_lossy(EngineEvent::PhaseChanged {
            phase_id: marker.id.clone(),
            state: marker.state.clone(),
            timestamp: EngineEvent::now(),
        });

        if marker.state.is_some() {
            self.phases
                .start_transition(&marker.id, Some(transition_ms), false);
        }
    }

    fn emit_progress(&self) {
        let (percent, elapsed_ms) = {
            let state = self.state.lock().unwrap();
            (state.progress_now(), state.elapsed_now())
        };
        self.bus.emit_lossy(EngineEvent::Progress {
            percent,
            elapsed_ms,
            timestamp: EngineEvent::now(),
        });
    }

    fn spawn_tickers(self: &Arc<Self>, gen: u64) {
        // progress ticker
        let timeline = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeline.pace.current()).await;
                {
                    let state = timeline.state.lock().unwrap();
                    if state.run_gen != gen || !state.playing {
                        break;
                    }
                }
                timeline.emit_progress();
                timeline.check_current_phase();

                if timeline.state.lock().unwrap().progress_now() >= 100.0 {
                    timeline.finish_session();
                    break;
                }
            }
        });

        // event ticker
        let timeline = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeline.event_tick).await;
                loop {
                    let due = {
                        let mut state = timeline.state.lock().unwrap();
                        if state.run_gen != gen || !state.playing {
                            return;
                        }
                        let elapsed = state.elapsed_now();
                        let index = state.next_event_index;
                        let ready = matches!(
                            state.events.get(index),
                            Some(event) if event.time_ms <= elapsed
                        );
                        if !ready {
                            None
                        } else {
                            let fired_already = state.events[index].fired;
                            state.events[index].fired = true;
                            state.next_event_index += 1;
                            if fired_already {
                                continue;
                            }
                            Some(state.events[index].clone())
                        }
                    };
                    match due {
                        Some(event) => {
                            debug!(event = %event.id, time_ms = event.time_ms, "scheduled event fired");
                            timeline.bus.emit_lossy(EngineEvent::ScheduledEvent {
                                event_id: event.id,
                                time_ms: event.time_ms,
                                payload: event.payload,
                                timestamp: EngineEvent::now(),
                            });
                        }
                        None => break,
                    }
                }
            }
        });
    }

    /// The session reached 100%: stop everything and announce the end
    fn finish_session(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.elapsed_ms = state.session_duration_ms;
            state.started_at = None;
            state.playing = false;
            state.run_gen += 1;
        }
        self.phases.cancel_all();
        warn!("session duration reached; timeline stopped itself");
        self.bus.emit_lossy(EngineEvent::PlaybackStateChanged {
            playing: false,
            timestamp: EngineEvent::now(),
        });
        self.bus.emit_lossy(EngineEvent::SessionEnded {
            timestamp: EngineEvent::now(),
        });
    }
}
