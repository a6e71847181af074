//! Audio node graph shared by the host backends
//!
//! A small WebAudio-shaped graph: buffer sources and gain nodes, each with
//! a single output edge, terminating at the destination node. Both backends
//! (mock and cpal) own one of these behind a mutex; the render thread reads
//! it, the control thread mutates it. All gain changes go through the
//! automation timeline; there is no direct value write.

use crate::audio::PcmBuffer;
use crate::error::{EngineError, Result};
use crate::host::automation::GainAutomation;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque node handle
pub type NodeId = u64;

/// Transport state of a buffer source
#[derive(Debug, Clone)]
pub(crate) struct SourceState {
    pub buffer: Arc<PcmBuffer>,

    pub playing: bool,

    /// Audio-clock time the source was last started
    pub started_at: f64,

    /// Position within the buffer at `started_at` (seconds)
    pub offset_secs: f64,
}

impl SourceState {
    /// Current playback position in seconds, wrapped modulo duration
    pub fn position_at(&self, now: f64) -> f64 {
        let duration = self.buffer.duration_secs();
        if duration <= 0.0 {
            return 0.0;
        }
        let raw = if self.playing {
            self.offset_secs + (now - self.started_at).max(0.0)
        } else {
            self.offset_secs
        };
        raw % duration
    }
}

pub(crate) enum NodeKind {
    Gain(GainAutomation),
    Source(SourceState),
    Destination,
}

struct Node {
    kind: NodeKind,
    /// Single output edge; `None` while disconnected
    output: Option<NodeId>,
}

/// The node graph
pub(crate) struct NodeGraph {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    destination: NodeId,
}

impl NodeGraph {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let destination: NodeId = 1;
        nodes.insert(
            destination,
            Node {
                kind: NodeKind::Destination,
                output: None,
            },
        );
        Self {
            nodes,
            next_id: 2,
            destination,
        }
    }

    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn create_gain(&mut self, initial: f32) -> NodeId {
        self.insert(NodeKind::Gain(GainAutomation::new(initial)))
    }

    pub fn create_source(&mut self, buffer: Arc<PcmBuffer>) -> NodeId {
        self.insert(NodeKind::Source(SourceState {
            buffer,
            playing: false,
            started_at: 0.0,
            offset_secs: 0.0,
        }))
    }

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&to) {
            return Err(unknown_node(to));
        }
        if from == to {
            return Err(EngineError::Invalid("node cannot connect to itself".into()));
        }
        let node = self.nodes.get_mut(&from).ok_or_else(|| unknown_node(from))?;
        if matches!(node.kind, NodeKind::Destination) {
            return Err(EngineError::Invalid(
                "destination node has no output".into(),
            ));
        }
        node.output = Some(to);
        Ok(())
    }

    pub fn disconnect(&mut self, node: NodeId) -> Result<()> {
        let node = self.nodes.get_mut(&node).ok_or_else(|| unknown_node(node))?;
        node.output = None;
        Ok(())
    }

    pub fn output_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|n| n.output)
    }

    pub fn set_gain_at(&mut self, node: NodeId, value: f32, at: f64) -> Result<()> {
        self.gain_mut(node)?.set_value_at(value, at);
        Ok(())
    }

    pub fn ramp_gain_to(&mut self, node: NodeId, value: f32, end_time: f64) -> Result<()> {
        self.gain_mut(node)?.ramp_to(value, end_time);
        Ok(())
    }

    pub fn cancel_ramps(&mut self, node: NodeId, at: f64) -> Result<()> {
        self.gain_mut(node)?.cancel_after(at);
        Ok(())
    }

    pub fn gain_value(&self, node: NodeId, at: f64) -> f32 {
        match self.nodes.get(&node) {
            Some(Node {
                kind: NodeKind::Gain(automation),
                ..
            }) => automation.value_at(at),
            _ => 0.0,
        }
    }

    pub fn start_source(&mut self, node: NodeId, now: f64) -> Result<()> {
        let source = self.source_mut(node)?;
        if !source.playing {
            source.playing = true;
            source.started_at = now;
        }
        Ok(())
    }

    pub fn stop_source(&mut self, node: NodeId, now: f64) -> Result<()> {
        let source = self.source_mut(node)?;
        if source.playing {
            source.offset_secs = source.position_at(now);
            source.playing = false;
        }
        Ok(())
    }

    pub fn source_playing(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(&node),
            Some(Node {
                kind: NodeKind::Source(SourceState { playing: true, .. }),
                ..
            })
        )
    }

    pub fn source_position(&self, node: NodeId, now: f64) -> f64 {
        match self.nodes.get(&node) {
            Some(Node {
                kind: NodeKind::Source(source),
                ..
            }) => source.position_at(now),
            _ => 0.0,
        }
    }

    pub fn seek_source(&mut self, node: NodeId, position_secs: f64, now: f64) -> Result<()> {
        let source = self.source_mut(node)?;
        let duration = source.buffer.duration_secs();
        source.offset_secs = position_secs.clamp(0.0, duration.max(0.0));
        source.started_at = now;
        Ok(())
    }

    pub fn source_duration(&self, node: NodeId) -> f64 {
        match self.nodes.get(&node) {
            Some(Node {
                kind: NodeKind::Source(source),
                ..
            }) => source.buffer.duration_secs(),
            _ => 0.0,
        }
    }

    pub fn release(&mut self, node: NodeId) {
        if node == self.destination {
            return;
        }
        self.nodes.remove(&node);
        for other in self.nodes.values_mut() {
            if other.output == Some(node) {
                other.output = None;
            }
        }
    }

    /// Product of all gain values on the path from `node` to the
    /// destination at time `at`
    ///
    /// Returns 0.0 when the path does not reach the destination (a
    /// disconnected node is inaudible).
    pub fn path_gain(&self, node: NodeId, at: f64) -> f32 {
        let mut gain = 1.0f32;
        let mut current = node;
        // bounded walk in case a stale edge forms a cycle
        for _ in 0..64 {
            if current == self.destination {
                return gain;
            }
            let Some(n) = self.nodes.get(&current) else {
                return 0.0;
            };
            if let NodeKind::Gain(automation) = &n.kind {
                gain *= automation.value_at(at);
            }
            match n.output {
                Some(next) => current = next,
                None => return 0.0,
            }
        }
        0.0
    }

    /// Iterate all playing sources with their buffer and transport state
    pub fn playing_sources(&self) -> Vec<(NodeId, SourceState)> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| match &node.kind {
                NodeKind::Source(s) if s.playing => Some((*id, s.clone())),
                _ => None,
            })
            .collect()
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, Node { kind, output: None });
        id
    }

    fn gain_mut(&mut self, node: NodeId) -> Result<&mut GainAutomation> {
        match self.nodes.get_mut(&node) {
            Some(Node {
                kind: NodeKind::Gain(automation),
                ..
            }) => Ok(automation),
            Some(_) => Err(EngineError::Invalid(format!("node {node} is not a gain"))),
            None => Err(unknown_node(node)),
        }
    }

    fn source_mut(&mut self, node: NodeId) -> Result<&mut SourceState> {
        match self.nodes.get_mut(&node) {
            Some(Node {
                kind: NodeKind::Source(source),
                ..
            }) => Ok(source),
            Some(_) => Err(EngineError::Invalid(format!("node {node} is not a source"))),
            None => Err(unknown_node(node)),
        }
    }
}

fn unknown_node(node: NodeId) -> EngineError {
    EngineError::NotFound {
        kind: "node",
        id: node.to_string(),
    }
}
