//! Sample-rate conversion using rubato
//!
//! One-shot whole-buffer conversion to the engine's working rate. Buffers
//! are decoded once and cached, so the conversion runs off the audio path
//! and quality wins over speed.

use crate::error::CacheError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Resample an interleaved stereo buffer from `input_rate` to `output_rate`
///
/// Returns the input unchanged when the rates already match.
pub fn resample_stereo(
    input: &[f32],
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<f32>, CacheError> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }
    if input_rate == 0 || output_rate == 0 {
        return Err(CacheError::Decode(format!(
            "cannot resample {input_rate}Hz to {output_rate}Hz"
        )));
    }

    let planar_input = deinterleave(input);
    let input_frames = planar_input[0].len();
    if input_frames == 0 {
        return Ok(Vec::new());
    }

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        input_frames,
        2,
    )
    .map_err(|e| CacheError::Decode(format!("resampler init failed: {e}")))?;

    let planar_output = resampler
        .process(&planar_input, None)
        .map_err(|e| CacheError::Decode(format!("resampling failed: {e}")))?;

    Ok(interleave(&planar_output))
}

/// `[L, R, L, R, ...]` → `[[L...], [R...]]`
fn deinterleave(samples: &[f32]) -> Vec<Vec<f32>> {
    let frames = samples.len() / 2;
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    for frame in samples.chunks_exact(2) {
        left.push(frame[0]);
        right.push(frame[1]);
    }
    vec![left, right]
}

/// `[[L...], [R...]]` → `[L, R, L, R, ...]`
fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let frames = planar[0].len().min(planar[1].len());
    let mut interleaved = Vec::with_capacity(frames * 2);
    for i in 0..frames {
        interleaved.push(planar[0][i]);
        interleaved.push(planar[1][i]);
    }
    interleaved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        let output = resample_stereo(&input, 44_100, 44_100).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_upsample_doubles_frame_count() {
        let input: Vec<f32> = (0..2_000)
            .flat_map(|i| {
                let s = (i as f32 / 100.0).sin();
                [s, s]
            })
            .collect();
        let output = resample_stereo(&input, 22_050, 44_100).unwrap();
        let out_frames = output.len() as f64 / 2.0;
        assert!((out_frames - 2_000.0 * 2.0).abs() < 32.0, "frames = {out_frames}");
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(resample_stereo(&[0.0, 0.0], 0, 44_100).is_err());
    }

    #[test]
    fn test_empty_input() {
        assert!(resample_stereo(&[], 48_000, 44_100).unwrap().is_empty());
    }
}
