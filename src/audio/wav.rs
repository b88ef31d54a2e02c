//! WAV file I/O.

use std::io::Cursor;
use std::path::Path;

use crate::Result;

/// Decoded PCM: interleaved f32 samples in [-1, 1].
#[derive(Debug, Clone)]
pub struct Pcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Pcm {
    /// Average interleaved channels down to one.
    pub fn into_mono(self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples;
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Read a WAV file from disk.
pub fn read_wav(path: impl AsRef<Path>) -> Result<Pcm> {
    let reader = hound::WavReader::open(path)?;
    decode(reader)
}

/// Decode a WAV file held in memory (e.g. a tar member).
pub fn read_wav_bytes(bytes: &[u8]) -> Result<Pcm> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    decode(reader)
}

fn decode<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Pcm> {
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    Ok(Pcm {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Write interleaved f32 samples as a 32-bit float WAV file.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: num_channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wav");
        let original = vec![0.0f32, 0.5, -0.5, 1.0, -1.0, 0.25];
        write_wav(&path, &original, 24000, 2).unwrap();

        let pcm = read_wav(&path).unwrap();
        assert_eq!(pcm.sample_rate, 24000);
        assert_eq!(pcm.channels, 2);
        for (a, b) in pcm.samples.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        let bytes = std::fs::read(&path).unwrap();
        let from_bytes = read_wav_bytes(&bytes).unwrap();
        assert_eq!(from_bytes.samples, pcm.samples);
    }

    #[test]
    fn int16_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("int.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(16384i16).unwrap();
        writer.write_sample(-32768i16).unwrap();
        writer.finalize().unwrap();

        let pcm = read_wav(&path).unwrap();
        assert!((pcm.samples[0] - 0.5).abs() < 1e-6);
        assert!((pcm.samples[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn stereo_downmix() {
        let pcm = Pcm {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 24000,
            channels: 2,
        };
        assert_eq!(pcm.into_mono(), vec![0.5, 0.5]);
    }
}
