//! Decoded audio representation and the decode pipeline
//!
//! Bytes come in from the transport, symphonia turns them into interleaved
//! stereo f32, rubato normalises the sample rate, and the result is shared
//! as a [`PcmBuffer`] behind an `Arc`. The `Arc` refcount doubles as the
//! cache's eviction pin: a buffer referenced by a live source node is never
//! evicted.

mod decode;
mod resample;
mod types;

pub use decode::decode_bytes;
pub use resample::resample_stereo;
pub use types::PcmBuffer;
