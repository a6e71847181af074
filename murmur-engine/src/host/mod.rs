//! Audio host abstraction
//!
//! The engine talks to audio hardware through the [`AudioBackend`] trait: a
//! monotonic clock, a node graph (buffer sources, gains, one destination)
//! and scheduled gain automation. Two backends ship: [`MockBackend`] for
//! deterministic tests and [`CpalBackend`] for real output.
//!
//! [`AudioHost`] wraps a backend with the master gain and output lifecycle.
//! Constructing any other engine component requires an initialised host, so
//! nothing can touch the graph before the backend exists.

mod automation;
mod device;
mod graph;
mod mock;

pub use device::CpalBackend;
pub use graph::NodeId;
pub use mock::MockBackend;

use crate::audio::PcmBuffer;
use crate::error::{EngineError, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Audio backend contract
///
/// Node handles are opaque ids owned by the backend. All gain mutation goes
/// through scheduled automation (`set_gain_at` / `ramp_gain_to`) evaluated
/// on the backend's clock; there is deliberately no bare value write.
pub trait AudioBackend: Send + Sync + 'static {
    /// Monotonic audio-clock time in seconds
    fn now(&self) -> f64;

    /// The output destination node
    fn destination(&self) -> NodeId;

    fn create_gain(&self, initial: f32) -> NodeId;

    fn create_source(&self, buffer: Arc<PcmBuffer>) -> NodeId;

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()>;

    fn disconnect(&self, node: NodeId) -> Result<()>;

    fn set_gain_at(&self, node: NodeId, value: f32, at: f64) -> Result<()>;

    fn ramp_gain_to(&self, node: NodeId, value: f32, end_time: f64) -> Result<()>;

    /// Cancel scheduled automation after the current time, freezing the
    /// current value
    fn cancel_ramps(&self, node: NodeId) -> Result<()>;

    /// Evaluated gain value at the current time
    fn gain_value(&self, node: NodeId) -> f32;

    fn start_source(&self, node: NodeId) -> Result<()>;

    fn stop_source(&self, node: NodeId) -> Result<()>;

    fn source_playing(&self, node: NodeId) -> bool;

    /// Playback position in seconds (sources loop; wraps modulo duration)
    fn source_position(&self, node: NodeId) -> f64;

    fn seek_source(&self, node: NodeId, position_secs: f64) -> Result<()>;

    fn source_duration(&self, node: NodeId) -> f64;

    /// Destroy a node and clear edges pointing at it
    fn release(&self, node: NodeId);

    fn resume(&self) -> Result<()>;

    fn suspend(&self) -> Result<()>;

    fn is_suspended(&self) -> bool;
}

/// Audio host: backend + master gain + output lifecycle
pub struct AudioHost {
    backend: Arc<dyn AudioBackend>,
    master: NodeId,
    master_volume: Mutex<f32>,
    volume_ramp_secs: f64,
    auto_resume: bool,
}

impl AudioHost {
    /// Initialise the host against a backend
    ///
    /// Creates the master gain and wires it to the destination. Everything
    /// else in the engine connects to [`AudioHost::mix_bus`] rather than the
    /// raw destination, so master volume applies to the whole mix.
    pub fn initialize(
        backend: Arc<dyn AudioBackend>,
        volume_ramp_secs: f64,
        auto_resume: bool,
    ) -> Result<Arc<Self>> {
        let master = backend.create_gain(1.0);
        backend.connect(master, backend.destination())?;
        debug!(master, "audio host initialised");
        Ok(Arc::new(Self {
            backend,
            master,
            master_volume: Mutex::new(1.0),
            volume_ramp_secs,
            auto_resume,
        }))
    }

    /// Monotonic audio-clock time in seconds
    pub fn now(&self) -> f64 {
        self.backend.now()
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// The master gain node
    pub fn master_gain(&self) -> NodeId {
        self.master
    }

    /// Node the per-layer gains connect to (the master gain)
    pub fn mix_bus(&self) -> NodeId {
        self.master
    }

    /// Set master volume with a short scheduled ramp
    ///
    /// Clamps to `[0, 1]` and never fails; a backend wiring error at this
    /// point means the node is gone and there is nothing useful to do but
    /// log it.
    pub fn set_master_volume(&self, level: f32) {
        let level = level.clamp(0.0, 1.0);
        *self.master_volume.lock().unwrap() = level;
        let now = self.backend.now();
        let current = self.backend.gain_value(self.master);
        let result = self
            .backend
            .cancel_ramps(self.master)
            .and_then(|_| self.backend.set_gain_at(self.master, current, now))
            .and_then(|_| {
                self.backend
                    .ramp_gain_to(self.master, level, now + self.volume_ramp_secs)
            });
        if let Err(e) = result {
            warn!("master volume change failed: {e}");
        }
    }

    /// Last requested master volume
    pub fn master_volume(&self) -> f32 {
        *self.master_volume.lock().unwrap()
    }

    /// Resume the output, retrying once on backend failure
    pub async fn resume(&self) -> Result<()> {
        match self.backend.resume() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("resume failed, retrying once: {first}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                self.backend.resume().map_err(|e| {
                    EngineError::Host(format!("resume failed after retry: {e}"))
                })
            }
        }
    }

    /// Suspend the output, retrying once on backend failure
    pub async fn suspend(&self) -> Result<()> {
        match self.backend.suspend() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("suspend failed, retrying once: {first}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                self.backend.suspend().map_err(|e| {
                    EngineError::Host(format!("suspend failed after retry: {e}"))
                })
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.backend.is_suspended()
    }

    /// Signal a user interaction; resumes a suspended output when configured
    pub async fn user_interaction(&self) -> Result<()> {
        if self.auto_resume && self.is_suspended() {
            debug!("auto-resuming output on user interaction");
            self.resume().await?;
        }
        Ok(())
    }

    /// Tear down the host: release the master gain and suspend the output
    pub fn teardown(&self) {
        self.backend.release(self.master);
        if let Err(e) = self.backend.suspend() {
            debug!("suspend during teardown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_initialize_wires_master_to_destination() {
        let backend = Arc::new(MockBackend::new());
        let host = AudioHost::initialize(backend.clone(), 0.01, false).unwrap();
        assert_eq!(
            backend.output_of(host.master_gain()),
            Some(backend.destination())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_volume_clamps_and_ramps() {
        let backend = Arc::new(MockBackend::new());
        let host = AudioHost::initialize(backend.clone(), 0.01, false).unwrap();

        host.set_master_volume(3.5);
        assert_eq!(host.master_volume(), 1.0);

        host.set_master_volume(-1.0);
        assert_eq!(host.master_volume(), 0.0);

        // ramp completes after the ramp window
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(backend.gain_value(host.master_gain()) < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_retries_once() {
        let backend = Arc::new(MockBackend::new());
        backend.suspend().unwrap();
        backend.fail_resumes(1);
        let host = AudioHost::initialize(backend.clone(), 0.01, false).unwrap();

        host.resume().await.unwrap();
        assert!(!host.is_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_resume_failure_is_host_error() {
        let backend = Arc::new(MockBackend::new());
        backend.suspend().unwrap();
        backend.fail_resumes(5);
        let host = AudioHost::initialize(backend.clone(), 0.01, false).unwrap();

        match host.resume().await {
            Err(EngineError::Host(_)) => {}
            other => panic!("expected host error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_interaction_auto_resumes() {
        let backend = Arc::new(MockBackend::new());
        backend.suspend().unwrap();
        let host = AudioHost::initialize(backend.clone(), 0.01, true).unwrap();

        host.user_interaction().await.unwrap();
        assert!(!host.is_suspended());
    }
}
