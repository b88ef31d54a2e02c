//! Sample-rate conversion with rubato's FFT resampler.

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

const CHUNK: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Resample mono audio from `sr_in` to `sr_out`.
///
/// The resampler's group delay is trimmed so the output stays aligned with
/// the input and has `ceil(len * sr_out / sr_in)` samples.
pub fn resample_mono(input: &[f32], sr_in: u32, sr_out: u32) -> Result<Vec<f32>> {
    if sr_in == sr_out || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(sr_in as usize, sr_out as usize, CHUNK, SUB_CHUNKS, 1)
            .map_err(|e| Error::Audio(format!("resampler setup: {e}")))?;

    let expected_len = (input.len() as f64 * sr_out as f64 / sr_in as f64).ceil() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected_len + delay + CHUNK);

    // Feed whole chunks, then zero-padded tail chunks until the delayed
    // signal has been flushed.
    let mut pos = 0;
    let mut chunk = vec![0.0f32; CHUNK];
    while out.len() < expected_len + delay {
        let end = (pos + CHUNK).min(input.len());
        chunk.fill(0.0);
        if pos < end {
            chunk[..end - pos].copy_from_slice(&input[pos..end]);
        }
        let frames = resampler
            .process(&[chunk.as_slice()], None)
            .map_err(|e| Error::Audio(format!("resample: {e}")))?;
        out.extend_from_slice(&frames[0]);
        pos = end;
    }

    Ok(out[delay..delay + expected_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_identity() {
        let audio = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_mono(&audio, 24000, 24000).unwrap(), audio);
    }

    #[test]
    fn downsample_length() {
        let audio = vec![0.5f32; 48000];
        let out = resample_mono(&audio, 48000, 24000).unwrap();
        assert_eq!(out.len(), 24000);
    }

    #[test]
    fn upsample_preserves_tone() {
        let audio: Vec<f32> = (0..16000)
            .map(|i| (2.0 * std::f32::consts::PI * 200.0 * i as f32 / 16000.0).sin())
            .collect();
        let out = resample_mono(&audio, 16000, 24000).unwrap();
        assert_eq!(out.len(), 24000);
        // Away from the edges the 200 Hz sine keeps its amplitude.
        let peak = out[6000..18000].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 1.0).abs() < 0.1, "peak {peak}");
    }
}
