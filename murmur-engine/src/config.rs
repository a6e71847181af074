//! Engine configuration
//!
//! All tunables live in one place with defaults that match the shipped
//! behaviour. Embedders construct an `EngineConfig` (usually via
//! `Default::default()`) and hand it to `SessionEngine::new`; the demo binary
//! deserializes the same struct from its TOML file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of decoded buffers kept in the cache
    pub max_cache_entries: usize,

    /// Working sample rate all cached buffers are normalised to (Hz)
    pub working_sample_rate: u32,

    /// Timeline progress tick interval (ms)
    pub progress_tick_ms: u64,

    /// Progress tick interval while a transition is active (ms)
    pub high_freq_tick_ms: u64,

    /// Scheduled-event tick interval (ms)
    pub event_tick_ms: u64,

    /// Lower clamp on crossfade duration (seconds)
    pub min_fade_secs: f64,

    /// Upper clamp on crossfade duration (seconds)
    pub max_fade_secs: f64,

    /// Ramp length for "immediate" volume changes (seconds)
    pub volume_ramp_secs: f64,

    /// Session duration used when a collection does not specify one (ms)
    pub default_session_duration_ms: u64,

    /// Transition duration used when a phase does not specify one (ms)
    pub default_transition_duration_ms: u64,

    /// Maximum concurrent loads during `preload`
    pub preload_concurrency: usize,

    /// Resume a suspended output on the first user-interaction signal
    pub auto_resume_on_interaction: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 24,
            working_sample_rate: 44_100,
            progress_tick_ms: 250,
            high_freq_tick_ms: 50,
            event_tick_ms: 100,
            min_fade_secs: 0.05,
            max_fade_secs: 30.0,
            volume_ramp_secs: 0.010,
            default_session_duration_ms: 3_600_000,
            default_transition_duration_ms: 10_000,
            preload_concurrency: 3,
            auto_resume_on_interaction: true,
        }
    }
}

impl EngineConfig {
    /// Progress tick as a `Duration`
    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    /// High-frequency progress tick as a `Duration`
    pub fn high_freq_tick(&self) -> Duration {
        Duration::from_millis(self.high_freq_tick_ms)
    }

    /// Scheduled-event tick as a `Duration`
    pub fn event_tick(&self) -> Duration {
        Duration::from_millis(self.event_tick_ms)
    }

    /// Clamp a crossfade duration (ms) into `[min_fade, max_fade]` seconds
    pub fn clamp_fade_secs(&self, duration_ms: u64) -> f64 {
        (duration_ms as f64 / 1000.0).clamp(self.min_fade_secs, self.max_fade_secs)
    }

    /// Validate ranges that would otherwise wedge the tickers
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_cache_entries == 0 {
            return Err(crate::EngineError::Invalid(
                "max_cache_entries must be greater than zero".into(),
            ));
        }
        if self.progress_tick_ms == 0 || self.event_tick_ms == 0 || self.high_freq_tick_ms == 0 {
            return Err(crate::EngineError::Invalid(
                "tick intervals must be greater than zero".into(),
            ));
        }
        if self.min_fade_secs <= 0.0 || self.max_fade_secs < self.min_fade_secs {
            return Err(crate::EngineError::Invalid(format!(
                "fade clamp [{}, {}] is not a valid range",
                self.min_fade_secs, self.max_fade_secs
            )));
        }
        if self.preload_concurrency == 0 {
            return Err(crate::EngineError::Invalid(
                "preload_concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_fade_clamp() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_fade_secs(2_000), 2.0);
        assert_eq!(config.clamp_fade_secs(0), 0.05);
        assert_eq!(config.clamp_fade_secs(120_000), 30.0);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let config = EngineConfig {
            event_tick_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_fade_range_rejected() {
        let config = EngineConfig {
            min_fade_secs: 5.0,
            max_fade_secs: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
