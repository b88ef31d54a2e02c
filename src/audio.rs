//! Audio front-end: WAV decoding, resampling and log-mel features.
//!
//! Training audio is normalized to mono 24 kHz before feature extraction.

mod mel;
mod resample;
mod wav;

pub use mel::{MelConfig, MelSpectrogram};
pub use resample::resample_mono;
pub use wav::{Pcm, read_wav, read_wav_bytes, write_wav};

/// Sample rate the codec operates at.
pub const SAMPLE_RATE: u32 = 24000;

/// Decode, downmix and resample a WAV payload to mono [`SAMPLE_RATE`].
pub fn load_mono_24k(bytes: &[u8]) -> crate::Result<Vec<f32>> {
    let pcm = read_wav_bytes(bytes)?;
    let sample_rate = pcm.sample_rate;
    let mono = pcm.into_mono();
    resample_mono(&mono, sample_rate, SAMPLE_RATE)
}
