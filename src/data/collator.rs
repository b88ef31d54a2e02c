//! Batch collation.
//!
//! Samples are right-padded to the longest text and audio in the batch on
//! the host ([`HostBatch`]), then moved to the run device as a [`Batch`].

use candle_core::{Device, Tensor};

use super::dataset::Sample;
use crate::{Error, Result};

/// Dense batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    pub speakers: Vec<String>,
    /// `[B, text_len]` (U32)
    pub text_input_ids: Tensor,
    /// `[B, text_len]` (U8)
    pub text_attention_mask: Tensor,
    /// `[B, 2·audio_len, n_mels]` (F32)
    pub audio_mel_specs: Tensor,
    /// `[B, audio_len]` (U8)
    pub audio_attention_mask: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.speakers.len()
    }
}

/// Padded batch in host memory, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub speakers: Vec<String>,
    pub text_len: usize,
    pub text_ids: Vec<u32>,
    pub text_mask: Vec<u8>,
    pub audio_len: usize,
    pub n_mels: usize,
    pub mel: Vec<f32>,
    pub audio_mask: Vec<u8>,
}

impl HostBatch {
    pub fn batch_size(&self) -> usize {
        self.speakers.len()
    }

    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        let b = self.batch_size();
        Ok(Batch {
            speakers: self.speakers.clone(),
            text_input_ids: Tensor::from_slice(&self.text_ids, (b, self.text_len), device)?,
            text_attention_mask: Tensor::from_slice(&self.text_mask, (b, self.text_len), device)?,
            audio_mel_specs: Tensor::from_slice(
                &self.mel,
                (b, self.audio_len * 2, self.n_mels),
                device,
            )?,
            audio_attention_mask: Tensor::from_slice(&self.audio_mask, (b, self.audio_len), device)?,
        })
    }
}

/// Pad `samples` into one batch. Text is padded with `text_pad`, mel frames
/// with zeros; padded mask entries are 0.
pub fn collate(samples: &[Sample], text_pad: u32, n_mels: usize) -> Result<HostBatch> {
    if samples.is_empty() {
        return Err(Error::Dataset("cannot collate an empty batch".into()));
    }
    let b = samples.len();
    let text_len = samples.iter().map(|s| s.text_ids.len()).max().unwrap_or(0);
    let audio_len = samples.iter().map(|s| s.audio_len).max().unwrap_or(0);

    let mut text_ids = vec![text_pad; b * text_len];
    let mut text_mask = vec![0u8; b * text_len];
    let mut mel = vec![0f32; b * audio_len * 2 * n_mels];
    let mut audio_mask = vec![0u8; b * audio_len];

    for (i, sample) in samples.iter().enumerate() {
        let t = sample.text_ids.len();
        text_ids[i * text_len..i * text_len + t].copy_from_slice(&sample.text_ids);
        text_mask[i * text_len..i * text_len + t].fill(1);

        if sample.mel.len() != sample.audio_len * 2 {
            return Err(Error::Dataset(format!(
                "{} mel frames for {} audio steps",
                sample.mel.len(),
                sample.audio_len
            )));
        }
        let row = i * audio_len * 2 * n_mels;
        for (f, frame) in sample.mel.iter().enumerate() {
            if frame.len() != n_mels {
                return Err(Error::Dataset(format!(
                    "mel frame has {} bins, expected {n_mels}",
                    frame.len()
                )));
            }
            let start = row + f * n_mels;
            mel[start..start + n_mels].copy_from_slice(frame);
        }
        audio_mask[i * audio_len..i * audio_len + sample.audio_len].fill(1);
    }

    Ok(HostBatch {
        speakers: samples.iter().map(|s| s.speaker.clone()).collect(),
        text_len,
        text_ids,
        text_mask,
        audio_len,
        n_mels,
        mel,
        audio_mask,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample(speaker: &str, text: &[u32], audio_len: usize) -> Sample {
        Sample {
            speaker: speaker.into(),
            text_ids: text.to_vec(),
            mel: (0..audio_len * 2).map(|f| vec![f as f32 + 1.0; 3]).collect(),
            audio_len,
        }
    }

    #[test]
    fn pads_text_and_audio() {
        let batch = collate(
            &[sample("a", &[5, 6, 7], 1), sample("b", &[8], 2)],
            0,
            3,
        )
        .unwrap();
        assert_eq!(batch.text_len, 3);
        assert_eq!(batch.text_ids, vec![5, 6, 7, 8, 0, 0]);
        assert_eq!(batch.text_mask, vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(batch.audio_len, 2);
        assert_eq!(batch.audio_mask, vec![1, 0, 1, 1]);
        // Row 0 has 2 real frames followed by 2 zero frames.
        assert_eq!(batch.mel[..6].to_vec(), vec![1f32, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(batch.mel[6..12].iter().all(|&v| v == 0.0));

        let device = Device::Cpu;
        let on_device = batch.to_device(&device).unwrap();
        assert_eq!(on_device.audio_mel_specs.dims(), &[2, 4, 3]);
        assert_eq!(on_device.text_input_ids.dtype(), DType::U32);
        assert_eq!(on_device.audio_attention_mask.dtype(), DType::U8);
        assert_eq!(on_device.batch_size(), 2);
    }

    #[test]
    fn rejects_inconsistent_samples() {
        let mut bad = sample("a", &[1], 2);
        bad.mel.pop();
        assert!(collate(&[bad], 0, 3).is_err());
        assert!(collate(&[], 0, 3).is_err());
    }
}
