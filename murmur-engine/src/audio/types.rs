//! Decoded PCM buffer type

/// A fully decoded audio buffer
///
/// Samples are interleaved stereo f32 (`[L, R, L, R, ...]`) at
/// `sample_rate`. Mono sources are duplicated, multi-channel sources
/// downmixed, at decode time; `source_channels` and `source_sample_rate`
/// record what the file actually contained.
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    /// Interleaved stereo samples
    pub samples: Vec<f32>,

    /// Sample rate of `samples` (the engine's working rate)
    pub sample_rate: u32,

    /// Channel count of the source file before stereo normalisation
    pub source_channels: u16,

    /// Sample rate of the source file before resampling
    pub source_sample_rate: u32,
}

impl PcmBuffer {
    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// In-memory size of the sample data in bytes
    pub fn byte_size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }

    /// Sample a stereo frame, wrapping position modulo the buffer length
    ///
    /// Sources loop: a one-hour session plays minutes-long stems, so
    /// position wraps rather than running off the end. Returns silence for
    /// an empty buffer.
    pub fn frame_at_wrapped(&self, frame: usize) -> (f32, f32) {
        let frames = self.frames();
        if frames == 0 {
            return (0.0, 0.0);
        }
        let idx = (frame % frames) * 2;
        (self.samples[idx], self.samples[idx + 1])
    }
}
