//! Playback control plane
//!
//! The components that turn a loaded collection into sound: per-layer
//! volume control, the crossfade engine, the layer manager, the phase
//! transition controller and the timeline scheduler. Constructed as a DAG
//! (host → volume/cache → crossfade → layers → phases → timeline), with
//! the shared [`TickPace`] handle resolving the one back-reference:
//! transitions raising the timeline's tick rate.

mod crossfade;
mod layers;
mod phases;
mod timeline;
mod volume;

pub use crossfade::{CrossfadeEngine, CrossfadeParams, CrossfadeProgressFn};
pub use layers::LayerManager;
pub use phases::PhaseController;
pub use timeline::{AddEvent, ScheduledEvent, Timeline};
pub use volume::{FadeProgressFn, VolumeController};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared progress-tick pace
///
/// The timeline ticks at the normal rate until a transition is active, then
/// at the high-frequency rate until none is. Owned jointly by the timeline
/// (reader) and the phase controller (writer) so neither needs a reference
/// to the other.
pub struct TickPace {
    high: AtomicBool,
    normal: Duration,
    fast: Duration,
}

impl TickPace {
    pub fn new(normal: Duration, fast: Duration) -> Self {
        Self {
            high: AtomicBool::new(false),
            normal,
            fast,
        }
    }

    /// Tick interval to use right now
    pub fn current(&self) -> Duration {
        if self.high.load(Ordering::Relaxed) {
            self.fast
        } else {
            self.normal
        }
    }

    pub fn set_high(&self, high: bool) {
        self.high.store(high, Ordering::Relaxed);
    }

    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::Relaxed)
    }
}
