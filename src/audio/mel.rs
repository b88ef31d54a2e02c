//! Log-mel spectrogram front-end (Vocos feature extractor).
//!
//! Matches the features the ChatTTS codec was trained on:
//! - Sample rate: 24000 Hz
//! - FFT size: 1024 (513 frequency bins), Hann window of the same length
//! - Hop length: 256
//! - Mel bins: 100, HTK scale, no filter-area normalization, 0 Hz – Nyquist
//! - Padding: reflect by `n_fft / 2` on both sides (STFT `center=True`)
//! - Magnitude spectrum (power 1), log compression `ln(clamp(mel, min=1e-5))`

use std::sync::Arc;

use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Configuration for the mel spectrogram. Defaults match Vocos 24 kHz.
#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            n_fft: 1024,
            hop_length: 256,
            n_mels: 100,
            f_min: 0.0,
            f_max: 12000.0,
        }
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the window, FFT plan and filterbank once; [`MelSpectrogram`]
/// is `Sync`, so one instance serves all dataset worker threads.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
    fft: Arc<dyn rustfft::Fft<f64>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let window = hann_window(config.n_fft);
        let filterbank = mel_filterbank(
            config.n_fft,
            config.n_mels,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        Self {
            config,
            window,
            filterbank,
            fft,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples == 0 {
            0
        } else {
            num_samples / self.config.hop_length + 1
        }
    }

    /// Compute a log-mel spectrogram, frame-major.
    ///
    /// Input: mono audio at the configured sample rate.
    /// Output: `[num_frames][n_mels]`.
    pub fn process(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        if samples.is_empty() {
            return Vec::new();
        }
        let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let pad = self.config.n_fft / 2;
        let padded = reflect_pad(&samples_f64, pad, pad);

        self.stft(&padded)
            .iter()
            .map(|magnitudes| {
                self.filterbank
                    .iter()
                    .map(|filter| {
                        let energy: f64 = filter
                            .iter()
                            .zip(magnitudes)
                            .filter(|(w, _)| **w > 0.0)
                            .map(|(w, m)| w * m)
                            .sum();
                        energy.max(1e-5).ln() as f32
                    })
                    .collect()
            })
            .collect()
    }

    /// One-sided magnitude spectra, one per hop.
    fn stft(&self, padded: &[f64]) -> Vec<Vec<f64>> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        let num_frames = padded.len().saturating_sub(n_fft) / hop + 1;

        let mut frames = Vec::with_capacity(num_frames);
        let mut buffer = vec![Complex::new(0.0, 0.0); n_fft];
        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            if start + n_fft > padded.len() {
                break;
            }
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + i] * self.window[i], 0.0);
            }
            self.fft.process(&mut buffer);
            frames.push(buffer[..num_bins].iter().map(|c| c.norm()).collect());
        }
        frames
    }
}

/// Periodic Hann window.
fn hann_window(length: usize) -> Vec<f64> {
    (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}

/// Reflect-pad a signal on both sides (edge sample not repeated).
///
/// Signals shorter than the pad reflect back and forth.
fn reflect_pad(signal: &[f64], pad_left: usize, pad_right: usize) -> Vec<f64> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(pad_left + len + pad_right);
    let reflect = |i: isize| -> f64 {
        if len == 1 {
            return signal[0];
        }
        let period = 2 * (len as isize - 1);
        let mut k = i.rem_euclid(period);
        if k >= len as isize {
            k = period - k;
        }
        signal[k as usize]
    };

    for i in (1..=pad_left as isize).rev() {
        padded.push(reflect(-i));
    }
    padded.extend_from_slice(signal);
    for i in 0..pad_right as isize {
        padded.push(reflect(len as isize + i));
    }
    padded
}

/// Triangular HTK mel filterbank without area normalization.
///
/// Returns `n_mels` filters, each with `n_fft/2 + 1` weights.
fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_htk(f_min);
    let mel_max = hz_to_mel_htk(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_htk(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
            bin_freqs
                .iter()
                .map(|&f| {
                    let down = (f - f_left) / (f_center - f_left);
                    let up = (f_right - f) / (f_right - f_center);
                    down.min(up).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn hz_to_mel_htk(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz_htk(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}
