//! Audio decoding using symphonia
//!
//! Decodes an in-memory byte body (wav/mp3/flac/aac/m4a/vorbis per the
//! enabled symphonia features) to interleaved stereo f32. Mono is
//! duplicated to stereo, multi-channel is downmixed by channel averaging.
//!
//! Decoding is CPU-bound and synchronous; the cache runs it on
//! `spawn_blocking`.

use crate::audio::{resample_stereo, PcmBuffer};
use crate::error::CacheError;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Decode a complete byte body into a [`PcmBuffer`] at `target_rate`
///
/// `hint_ext` is a file extension hint for the probe (derived from the URL
/// path by the cache), not required for well-formed containers.
pub fn decode_bytes(
    bytes: Vec<u8>,
    hint_ext: Option<&str>,
    target_rate: u32,
) -> Result<PcmBuffer, CacheError> {
    let cursor = std::io::Cursor::new(bytes);
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = hint_ext {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| CacheError::Decode(format!("probe failed: {e}")))?;

    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| CacheError::Decode("no audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let source_sample_rate = codec_params.sample_rate.unwrap_or(target_rate);
    let source_channels = codec_params.channels.map(|c| c.count()).unwrap_or(2) as u16;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| CacheError::Decode(format!("unsupported codec: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            // End of an in-memory stream also surfaces as ResetRequired
            // from some demuxers; treat anything else as corruption.
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(CacheError::Decode(format!("demux failed: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => convert_to_stereo_f32(&decoded, &mut samples)?,
            // A corrupt packet mid-stream is skippable; give up only on
            // hard failures.
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
            }
            Err(e) => return Err(CacheError::Decode(format!("decode failed: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(CacheError::Decode("stream decoded to zero samples".into()));
    }

    let samples = if source_sample_rate != target_rate {
        resample_stereo(&samples, source_sample_rate, target_rate)?
    } else {
        samples
    };

    debug!(
        frames = samples.len() / 2,
        source_rate = source_sample_rate,
        source_channels,
        "decoded audio buffer"
    );

    Ok(PcmBuffer {
        samples,
        sample_rate: target_rate,
        source_channels,
        source_sample_rate,
    })
}

/// Append a decoded packet to `out` as interleaved stereo f32
///
/// Handles the sample formats the enabled codecs emit (f32/f64 for lossy
/// codecs, s16/s32/u8 for PCM containers).
fn convert_to_stereo_f32(buffer: &AudioBufferRef, out: &mut Vec<f32>) -> Result<(), CacheError> {
    match buffer {
        AudioBufferRef::F32(buf) => extend_stereo(out, buf.spec().channels.count(), buf.frames(), |ch, i| buf.chan(ch)[i]),
        AudioBufferRef::F64(buf) => extend_stereo(out, buf.spec().channels.count(), buf.frames(), |ch, i| buf.chan(ch)[i] as f32),
        AudioBufferRef::S16(buf) => extend_stereo(out, buf.spec().channels.count(), buf.frames(), |ch, i| {
            buf.chan(ch)[i] as f32 / i16::MAX as f32
        }),
        AudioBufferRef::S32(buf) => extend_stereo(out, buf.spec().channels.count(), buf.frames(), |ch, i| {
            buf.chan(ch)[i] as f32 / i32::MAX as f32
        }),
        AudioBufferRef::U8(buf) => extend_stereo(out, buf.spec().channels.count(), buf.frames(), |ch, i| {
            (buf.chan(ch)[i] as f32 - 128.0) / 128.0
        }),
        other => Err(CacheError::Decode(format!(
            "unsupported sample format: {:?} channels",
            other.spec().channels
        ))),
    }
}

/// Interleave `frames` frames of `channels`-channel audio into stereo
fn extend_stereo<F>(
    out: &mut Vec<f32>,
    channels: usize,
    frames: usize,
    sample: F,
) -> Result<(), CacheError>
where
    F: Fn(usize, usize) -> f32,
{
    if channels == 0 {
        return Err(CacheError::Decode("zero-channel stream".into()));
    }
    out.reserve(frames * 2);
    match channels {
        1 => {
            for i in 0..frames {
                let s = sample(0, i);
                out.push(s);
                out.push(s);
            }
        }
        2 => {
            for i in 0..frames {
                out.push(sample(0, i));
                out.push(sample(1, i));
            }
        }
        n => {
            // Average even channels into left, odd into right.
            let halves = (n as f32 / 2.0).max(1.0);
            for i in 0..frames {
                let mut left = 0.0f32;
                let mut right = 0.0f32;
                for ch in 0..n {
                    let s = sample(ch, i);
                    if ch % 2 == 0 {
                        left += s;
                    } else {
                        right += s;
                    }
                }
                out.push(left / halves);
                out.push(right / halves);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an in-memory 16-bit WAV body
    fn wav_bytes(channels: u16, sample_rate: u32, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                let t = i as f32 / sample_rate as f32;
                let s = (t * 440.0 * std::f32::consts::TAU).sin();
                for _ in 0..channels {
                    writer.write_sample((s * i16::MAX as f32 * 0.5) as i16).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_stereo_wav() {
        let bytes = wav_bytes(2, 44_100, 4_410);
        let buffer = decode_bytes(bytes, Some("wav"), 44_100).unwrap();
        assert_eq!(buffer.frames(), 4_410);
        assert_eq!(buffer.sample_rate, 44_100);
        assert_eq!(buffer.source_channels, 2);
        assert!((buffer.duration_secs() - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_decode_mono_duplicates_to_stereo() {
        let bytes = wav_bytes(1, 44_100, 1_000);
        let buffer = decode_bytes(bytes, Some("wav"), 44_100).unwrap();
        assert_eq!(buffer.frames(), 1_000);
        assert_eq!(buffer.source_channels, 1);
        // Left and right identical for a duplicated mono source
        assert_eq!(buffer.samples[10], buffer.samples[11]);
    }

    #[test]
    fn test_decode_resamples_to_working_rate() {
        let bytes = wav_bytes(2, 22_050, 2_205);
        let buffer = decode_bytes(bytes, Some("wav"), 44_100).unwrap();
        assert_eq!(buffer.sample_rate, 44_100);
        assert_eq!(buffer.source_sample_rate, 22_050);
        // 0.1s of audio at the new rate, within resampler edge tolerance
        let frames = buffer.frames() as f64;
        assert!((frames - 4_410.0).abs() < 64.0, "frames = {frames}");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_bytes(vec![0u8; 512], Some("wav"), 44_100);
        assert!(matches!(result, Err(CacheError::Decode(_))));
    }
}
