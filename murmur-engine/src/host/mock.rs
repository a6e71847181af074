//! Deterministic mock backend for tests
//!
//! No audio I/O. The clock is `tokio::time::Instant`, so tests running with
//! a paused runtime control time exactly; gain automation is evaluated
//! analytically from the scheduled segments, so asserted values match what
//! a real render would produce. The graph is fully introspectable.

use crate::audio::PcmBuffer;
use crate::error::{EngineError, Result};
use crate::host::graph::{NodeGraph, NodeId};
use crate::host::AudioBackend;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Mock audio backend
pub struct MockBackend {
    graph: Mutex<NodeGraph>,
    epoch: tokio::time::Instant,
    suspended: AtomicBool,
    /// Remaining resume attempts that should fail (failure injection)
    resume_failures: AtomicU32,
    /// Remaining suspend attempts that should fail
    suspend_failures: AtomicU32,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            graph: Mutex::new(NodeGraph::new()),
            epoch: tokio::time::Instant::now(),
            suspended: AtomicBool::new(false),
            resume_failures: AtomicU32::new(0),
            suspend_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` resume calls fail
    pub fn fail_resumes(&self, n: u32) {
        self.resume_failures.store(n, Ordering::Relaxed);
    }

    /// Make the next `n` suspend calls fail
    pub fn fail_suspends(&self, n: u32) {
        self.suspend_failures.store(n, Ordering::Relaxed);
    }

    // ---- test introspection ----

    /// Output edge of a node
    pub fn output_of(&self, node: NodeId) -> Option<NodeId> {
        self.graph.lock().unwrap().output_of(node)
    }

    /// Product of gains from `node` to the destination at the current time
    pub fn path_gain(&self, node: NodeId) -> f32 {
        let now = self.now();
        self.graph.lock().unwrap().path_gain(node, now)
    }

    /// Evaluated gain value at an arbitrary time
    pub fn gain_value_at(&self, node: NodeId, at: f64) -> f32 {
        self.graph.lock().unwrap().gain_value(node, at)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MockBackend {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn destination(&self) -> NodeId {
        self.graph.lock().unwrap().destination()
    }

    fn create_gain(&self, initial: f32) -> NodeId {
        self.graph.lock().unwrap().create_gain(initial)
    }

    fn create_source(&self, buffer: Arc<PcmBuffer>) -> NodeId {
        self.graph.lock().unwrap().create_source(buffer)
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        self.graph.lock().unwrap().connect(from, to)
    }

    fn disconnect(&self, node: NodeId) -> Result<()> {
        self.graph.lock().unwrap().disconnect(node)
    }

    fn set_gain_at(&self, node: NodeId, value: f32, at: f64) -> Result<()> {
        self.graph.lock().unwrap().set_gain_at(node, value, at)
    }

    fn ramp_gain_to(&self, node: NodeId, value: f32, end_time: f64) -> Result<()> {
        self.graph.lock().unwrap().ramp_gain_to(node, value, end_time)
    }

    fn cancel_ramps(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().cancel_ramps(node, now)
    }

    fn gain_value(&self, node: NodeId) -> f32 {
        let now = self.now();
        self.graph.lock().unwrap().gain_value(node, now)
    }

    fn start_source(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().start_source(node, now)
    }

    fn stop_source(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().stop_source(node, now)
    }

    fn source_playing(&self, node: NodeId) -> bool {
        self.graph.lock().unwrap().source_playing(node)
    }

    fn source_position(&self, node: NodeId) -> f64 {
        let now = self.now();
        self.graph.lock().unwrap().source_position(node, now)
    }

    fn seek_source(&self, node: NodeId, position_secs: f64) -> Result<()> {
        let now = self.now();
        self.graph
            .lock()
            .unwrap()
            .seek_source(node, position_secs, now)
    }

    fn source_duration(&self, node: NodeId) -> f64 {
        self.graph.lock().unwrap().source_duration(node)
    }

    fn release(&self, node: NodeId) {
        self.graph.lock().unwrap().release(node)
    }

    fn resume(&self) -> Result<()> {
        if self.resume_failures.load(Ordering::Relaxed) > 0 {
            self.resume_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::Host("injected resume failure".into()));
        }
        self.suspended.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        if self.suspend_failures.load(Ordering::Relaxed) > 0 {
            self.suspend_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::Host("injected suspend failure".into()));
        }
        self.suspended.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}
