//! Error types for the session engine
//!
//! Expected errors use `Result<T, E>` with meaningful error enums; validation
//! failures surface immediately to the caller and leave state unchanged.

use thiserror::Error;

/// Main error type for the session engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable audio backend (no output device, unsupported format)
    #[error("Audio backend unavailable: {0}")]
    Unsupported(String),

    /// The audio backend rejected a state change (resume/suspend/wiring)
    #[error("Audio host error: {0}")]
    Host(String),

    /// Unknown phase, track, layer, node or event id
    #[error("{kind} not found: {id}")]
    NotFound {
        kind: &'static str,
        id: String,
    },

    /// Out-of-range numeric, malformed payload, duplicate event id
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Operation refused because the engine is in an incompatible state
    #[error("Operation refused: {0}")]
    Busy(String),

    /// Buffer load/decode errors
    #[error("Buffer error: {0}")]
    Cache(#[from] CacheError),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Errors from fetching and decoding audio buffers
///
/// Cloneable so a single failed in-flight load can be reported to every
/// caller sharing it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Transport-level failure (DNS, connect, mid-stream drop)
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP error: status {status}")]
    Http {
        status: u16,
    },

    /// Payload could not be decoded as audio
    #[error("Decode error: {0}")]
    Decode(String),

    /// The load was cancelled before completion
    #[error("Load aborted")]
    Aborted,
}

impl CacheError {
    /// Short machine-readable kind, used in buffer error events
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Network(_) => "network",
            CacheError::Http { .. } => "http",
            CacheError::Decode(_) => "decode",
            CacheError::Aborted => "aborted",
        }
    }
}

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_error_kinds_distinct() {
        use std::collections::HashSet;

        let errors = [
            CacheError::Network("refused".into()),
            CacheError::Http { status: 404 },
            CacheError::Decode("bad header".into()),
            CacheError::Aborted,
        ];

        let kinds: HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_cache_error_propagates_into_engine_error() {
        fn load() -> Result<()> {
            Err(CacheError::Http { status: 503 })?
        }

        match load() {
            Err(EngineError::Cache(CacheError::Http { status })) => assert_eq!(status, 503),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
