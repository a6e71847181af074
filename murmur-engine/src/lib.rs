//! # murmur-engine
//!
//! Session-driven generative audio engine. A session plays a *collection*
//! (parallel audio layers, each with a pool of interchangeable tracks)
//! for a configured duration while crossing an ordered sequence of
//! *phases*; each phase boundary applies that phase's captured per-layer
//! volumes and track selections through click-free crossfades.
//!
//! **Architecture:** tokio control plane over a WebAudio-shaped node graph
//! behind the [`host::AudioBackend`] trait. Audio rendering happens on the
//! backend's real-time path driven purely by gain automation scheduled on
//! the audio clock; the control plane never blocks it. Ships with a cpal
//! backend for real output and a deterministic mock for tests.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod model;
pub mod net;
pub mod playback;
pub mod session;
pub mod state;

pub use config::EngineConfig;
pub use error::{CacheError, EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use session::SessionEngine;
