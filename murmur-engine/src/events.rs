//! Event system for the session engine
//!
//! One typed enum, one bounded broadcast channel. Every externally visible
//! occurrence (progress ticks, phase changes, transitions, buffer loads)
//! is an `EngineEvent` emitted on the `EventBus`. Subscribers that lag are
//! dropped by the broadcast channel rather than blocking the engine, so a
//! misbehaving consumer cannot corrupt internal state.
//!
//! Per-operation progress reporting (`load`, `fade_volume`, `crossfade`)
//! stays on explicit closure arguments; the bus carries no per-tick load
//! progress.

use crate::model::PhaseState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine event types
///
/// Broadcast via [`EventBus`]; serializable so UI clients can forward them
/// over whatever wire they own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Periodic session progress update
    Progress {
        /// Percent of the session elapsed, `0.0..=100.0`
        percent: f64,
        /// Elapsed session time (milliseconds)
        elapsed_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The active phase changed (boundary crossed, seek, or manual trigger)
    ///
    /// Fires strictly after the timeline's current phase has been updated.
    PhaseChanged {
        phase_id: String,
        /// Captured state of the phase, if it has one
        state: Option<PhaseState>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A scheduled timeline event fired
    ScheduledEvent {
        event_id: String,
        /// Absolute session time the event was scheduled for (milliseconds)
        time_ms: u64,
        /// Caller-supplied payload, passed through untouched
        payload: Option<serde_json::Value>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A phase transition began applying its captured state
    TransitionStarted {
        phase_id: String,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A phase transition finished (all fades and switches dispatched and settled)
    ///
    /// For queued transitions, completion of one fires before the start of
    /// the next.
    TransitionCompleted {
        phase_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A buffer finished loading and entered the cache
    BufferLoaded {
        url: String,
        duration_secs: f64,
        sample_rate: u32,
        channels: u16,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A buffer load failed
    BufferError {
        url: String,
        /// Machine-readable kind: `network`, `http`, `decode`, `aborted`, `host`
        kind: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback started or stopped (pause, resume, stop, session end)
    PlaybackStateChanged {
        playing: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The session reached 100% and stopped itself
    SessionEnded {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Current UTC timestamp, for event construction
    pub fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// Bounded in-process event channel
///
/// Thin wrapper over `tokio::sync::broadcast`. Cloneable; all clones share
/// the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus with the given channel capacity
    ///
    /// Old events are dropped for slow subscribers once the buffer fills.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the subscriber count, or an error when nobody is listening.
    pub fn emit(&self, event: EngineEvent) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// High-frequency emitters (progress ticks, buffer events) use this; a
    /// session with no listeners is not an error.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_new() {
        let bus = EventBus::new(64);
        assert_eq!(bus.capacity(), 64);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_no_subscribers_is_err() {
        let bus = EventBus::new(16);
        assert!(bus
            .emit(EngineEvent::SessionEnded {
                timestamp: EngineEvent::now(),
            })
            .is_err());

        // lossy variant must not panic either way
        bus.emit_lossy(EngineEvent::SessionEnded {
            timestamp: EngineEvent::now(),
        });
    }

    #[tokio::test]
    async fn test_emit_with_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::Progress {
            percent: 50.0,
            elapsed_ms: 30_000,
            timestamp: EngineEvent::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::Progress {
                percent,
                elapsed_ms,
                ..
            } => {
                assert_eq!(percent, 50.0);
                assert_eq!(elapsed_ms, 30_000);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(EngineEvent::PhaseChanged {
            phase_id: "peak".into(),
            state: None,
            timestamp: EngineEvent::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "PhaseChanged");
        assert_eq!(json["phase_id"], "peak");
    }
}
