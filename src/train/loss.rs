//! Loss composition for the sequence stage.
//!
//! The backbone's hidden states `[B, T + A + 1, H]` are split at `T - 1`:
//! position `i` predicts position `i + 1`, so the last text position predicts
//! the first audio step.
//!
//! ```text
//! hidden   t0 .. t(T-2) │ t(T-1) a0 .. a(A-1) │ end
//!          └ text head ┘ └── audio heads ────┘
//!                               └ decoder ┘  (reconstruction, marker excluded)
//! ```
//!
//! The audio cross-entropy is one call over all codebook slots and steps
//! flattened together. Codebooks are therefore weighted by how many valid
//! positions they contribute rather than averaged one by one.

use candle_core::{D, DType, Module, Result, Tensor};

use super::assembler::{AssembledSequence, IGNORE_INDEX};
use crate::model::{Dvae, Gpt};

/// Mean negative log-likelihood over rows whose label is not [`IGNORE_INDEX`].
///
/// - `logits`: `[N, C]`
/// - `labels`: `[N]` (I64)
///
/// Returns a scalar; 0 when every row is ignored.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::I64)?;
    let valid = labels.ne(IGNORE_INDEX)?;
    let targets = valid
        .where_cond(&labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;

    let weights = valid.to_dtype(DType::F32)?;
    let count = weights.sum_all()?.maximum(1f32)?;
    (picked * weights)?.sum_all()?.neg()?.div(&count)
}

/// Loss terms of one step.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub total: Tensor,
    pub audio_loss: Tensor,
    pub text_loss: Option<Tensor>,
    pub mse_loss: Tensor,
}

impl LossOutput {
    /// Named scalar values for the meters, in logging order.
    pub fn meters(&self) -> Result<Vec<(&'static str, f64)>> {
        let scalar = |t: &Tensor| -> Result<f64> { Ok(f64::from(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)) };
        let mut meters = vec![
            ("loss", scalar(&self.total)?),
            ("audio_loss", scalar(&self.audio_loss)?),
        ];
        if let Some(text) = &self.text_loss {
            meters.push(("text_loss", scalar(text)?));
        }
        meters.push(("mse_loss", scalar(&self.mse_loss)?));
        Ok(meters)
    }
}

/// Combines the audio, text and reconstruction terms.
#[derive(Debug, Clone, Copy)]
pub struct LossRouter {
    pub train_text: bool,
    pub mse_weight: f64,
}

impl LossRouter {
    pub fn new(train_text: bool, mse_weight: f64) -> Self {
        Self {
            train_text,
            mse_weight,
        }
    }

    /// - `hidden`: backbone output `[B, T + A + 1, H]`
    /// - `decoder`: codec decoder taking `[B, H, A]`
    /// - `mel`: target `[B, 2A, n_mels]`
    pub fn route(
        &self,
        gpt: &Gpt,
        decoder: &Dvae,
        hidden: &Tensor,
        seq: &AssembledSequence,
        mel: &Tensor,
    ) -> Result<LossOutput> {
        let (b, s, _) = hidden.dims3()?;
        let text_len = seq.text_len;
        let audio_len = seq.audio_len;
        if text_len == 0 || s != seq.seq_len() {
            candle_core::bail!(
                "hidden length {s} does not match text {text_len} + audio {audio_len} + 1"
            );
        }
        if audio_len == 0 {
            candle_core::bail!("batch has no audio steps to decode");
        }
        let num_vq = gpt.num_vq();

        // Audio: steps T-1 .. T+A-1 predict labels T .. T+A.
        let audio_hidden = hidden.narrow(1, text_len - 1, audio_len + 1)?;
        let audio_logits = gpt.audio_logits(&audio_hidden)?;
        let n_classes = audio_logits.dim(D::Minus1)?;
        let audio_labels = seq.labels.narrow(1, text_len, audio_len + 1)?;
        let audio_loss = masked_cross_entropy(
            &audio_logits.reshape((b * (audio_len + 1) * num_vq, n_classes))?,
            &audio_labels.flatten_all()?,
        )?;

        let text_loss = if self.train_text && text_len > 1 {
            let text_hidden = hidden.narrow(1, 0, text_len - 1)?;
            let text_logits = gpt.text_logits(&text_hidden)?;
            let vocab = text_logits.dim(D::Minus1)?;
            let text_labels = seq.labels.narrow(1, 1, text_len - 1)?.narrow(2, 0, 1)?;
            Some(masked_cross_entropy(
                &text_logits.reshape((b * (text_len - 1), vocab))?,
                &text_labels.flatten_all()?,
            )?)
        } else if self.train_text {
            Some(audio_loss.zeros_like()?)
        } else {
            None
        };

        // Reconstruction from the audio-step states, end marker excluded.
        let codec_in = audio_hidden.narrow(1, 0, audio_len)?.transpose(1, 2)?.contiguous()?;
        let reconstructed = decoder.forward(&codec_in)?.transpose(1, 2)?;
        let mse_loss = candle_nn::loss::mse(
            &reconstructed.to_dtype(DType::F32)?,
            &mel.to_dtype(DType::F32)?,
        )?;

        let mut total = (&audio_loss + (&mse_loss * self.mse_weight)?)?;
        if let Some(text) = &text_loss {
            total = (total + text)?;
        }
        Ok(LossOutput {
            total,
            audio_loss,
            text_loss,
            mse_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, GptConfig};
    use crate::model::ParamStore;
    use crate::train::assembler::{AUDIO_EOS_ID, assemble};
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn ignored_rows_drop_out() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (4, 5), &device).unwrap();
        let labels = Tensor::new(&[1i64, IGNORE_INDEX, 3, IGNORE_INDEX], &device).unwrap();
        let masked = masked_cross_entropy(&logits, &labels).unwrap();

        let kept = Tensor::cat(
            &[&logits.narrow(0, 0, 1).unwrap(), &logits.narrow(0, 2, 1).unwrap()],
            0,
        )
        .unwrap();
        let targets = Tensor::new(&[1u32, 3], &device).unwrap();
        let plain = candle_nn::loss::cross_entropy(&kept, &targets).unwrap();
        assert!((scalar(&masked) - scalar(&plain)).abs() < 1e-5);
    }

    #[test]
    fn matches_plain_cross_entropy_without_ignores() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (6, 7), &device).unwrap();
        let labels = Tensor::new(&[0i64, 1, 2, 3, 4, 6], &device).unwrap();
        let masked = masked_cross_entropy(&logits, &labels).unwrap();
        let plain =
            candle_nn::loss::cross_entropy(&logits, &labels.to_dtype(DType::U32).unwrap()).unwrap();
        assert!((scalar(&masked) - scalar(&plain)).abs() < 1e-5);
    }

    #[test]
    fn all_ignored_is_zero() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (3, 4), &device).unwrap();
        let labels = Tensor::full(IGNORE_INDEX, 3, &device).unwrap();
        assert_eq!(scalar(&masked_cross_entropy(&logits, &labels).unwrap()), 0.0);
    }

    struct Fixture {
        _store: ParamStore,
        gpt: Gpt,
        decoder: Dvae,
        hidden: Tensor,
        seq: AssembledSequence,
        mel: Tensor,
    }

    /// Batch of 2 with text lengths [3, 2] of 3 and audio lengths [2, 1] of 2.
    fn fixture() -> Fixture {
        fixture_with_audio_mask(&[[1, 1], [1, 0]])
    }

    fn fixture_with_audio_mask(audio_mask: &[[u8; 2]; 2]) -> Fixture {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let cfg = GptConfig::tiny();
        let gpt = Gpt::new(&cfg, None, store.var_builder().pp("gpt_model")).unwrap();
        let decoder = Dvae::new(&DecoderConfig::tiny(), None, store.var_builder().pp("decoder_model"))
            .unwrap();

        let text_ids = Tensor::new(&[[5u32, 6, 7], [8, 9, 0]], &device).unwrap();
        let text_mask = Tensor::new(&[[1u8, 1, 1], [1, 1, 0]], &device).unwrap();
        let audio_ids = Tensor::new(&[[[1u32, 2], [3, 4]], [[5, 6], [7, 8]]], &device).unwrap();
        let audio_mask = Tensor::new(audio_mask, &device).unwrap();
        let seq = assemble(&text_ids, &text_mask, &audio_ids, &audio_mask).unwrap();
        let hidden = Tensor::randn(0f32, 1.0, (2, seq.seq_len(), cfg.hidden_size), &device).unwrap();
        let mel = Tensor::randn(0f32, 1.0, (2, 4, 10), &device).unwrap();
        Fixture {
            _store: store,
            gpt,
            decoder,
            hidden,
            seq,
            mel,
        }
    }

    #[test]
    fn total_combines_terms() {
        let f = fixture();
        let out = LossRouter::new(false, 0.01)
            .route(&f.gpt, &f.decoder, &f.hidden, &f.seq, &f.mel)
            .unwrap();
        assert!(out.text_loss.is_none());
        let expected = scalar(&out.audio_loss) + 0.01 * scalar(&out.mse_loss);
        assert!((scalar(&out.total) - expected).abs() < 1e-5);

        let names: Vec<&str> = out.meters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["loss", "audio_loss", "mse_loss"]);
    }

    #[test]
    fn text_loss_raises_total() {
        let f = fixture();
        let without = LossRouter::new(false, 0.01)
            .route(&f.gpt, &f.decoder, &f.hidden, &f.seq, &f.mel)
            .unwrap();
        let with = LossRouter::new(true, 0.01)
            .route(&f.gpt, &f.decoder, &f.hidden, &f.seq, &f.mel)
            .unwrap();
        let text = scalar(with.text_loss.as_ref().unwrap());
        assert!(text > 0.0);
        assert!(scalar(&with.total) > scalar(&without.total));
        assert!((scalar(&with.total) - scalar(&without.total) - text).abs() < 1e-4);

        let names: Vec<&str> = with.meters().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["loss", "audio_loss", "text_loss", "mse_loss"]);
    }

    #[test]
    fn batch_without_audio_frames_scores_end_markers() {
        let f = fixture_with_audio_mask(&[[0, 0], [0, 0]]);
        let out = LossRouter::new(false, 0.01)
            .route(&f.gpt, &f.decoder, &f.hidden, &f.seq, &f.mel)
            .unwrap();
        let audio = scalar(&out.audio_loss);
        assert!(audio.is_finite() && audio > 0.0);

        // Only the end marker at the first audio step of each row is labelled.
        let (t, v) = (f.seq.text_len, f.gpt.num_vq());
        let audio_labels = f.seq.labels.narrow(1, t, f.seq.audio_len + 1).unwrap();
        let counted: Vec<Vec<Vec<i64>>> = audio_labels.to_vec3().unwrap();
        for row in &counted {
            assert_eq!(row[0], vec![AUDIO_EOS_ID as i64; v]);
            assert!(row[1..].iter().flatten().all(|&l| l == IGNORE_INDEX));
        }

        let marker_logits = f
            .gpt
            .audio_logits(&f.hidden.narrow(1, t - 1, 1).unwrap())
            .unwrap();
        let classes = marker_logits.dim(D::Minus1).unwrap();
        let expected = masked_cross_entropy(
            &marker_logits.reshape((2 * v, classes)).unwrap(),
            &Tensor::full(AUDIO_EOS_ID as i64, 2 * v, &Device::Cpu).unwrap(),
        )
        .unwrap();
        assert!((audio - scalar(&expected)).abs() < 1e-5);
    }

    #[test]
    fn empty_audio_segment_is_an_error() {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let gpt = Gpt::new(&GptConfig::tiny(), None, store.var_builder().pp("gpt_model")).unwrap();
        let decoder =
            Dvae::new(&DecoderConfig::tiny(), None, store.var_builder().pp("decoder_model")).unwrap();
        // Text only, end marker at the first audio step.
        let seq = AssembledSequence {
            input_ids: Tensor::zeros((1, 3, 2), DType::U32, &device).unwrap(),
            attention_mask: Tensor::ones((1, 3), DType::U8, &device).unwrap(),
            text_mask: Tensor::new(&[[1u8, 1, 0]], &device).unwrap(),
            labels: Tensor::zeros((1, 3, 2), DType::I64, &device).unwrap(),
            text_len: 2,
            audio_len: 0,
        };
        let hidden = Tensor::randn(0f32, 1.0, (1, seq.seq_len(), 16), &device).unwrap();
        let mel = Tensor::zeros((1, 2, 10), DType::F32, &device).unwrap();
        assert!(
            LossRouter::new(false, 0.01)
                .route(&gpt, &decoder, &hidden, &seq, &mel)
                .is_err()
        );
    }

    #[test]
    fn hidden_length_must_match() {
        let f = fixture();
        let short = f.hidden.narrow(1, 0, f.seq.seq_len() - 1).unwrap();
        assert!(
            LossRouter::new(false, 0.01)
                .route(&f.gpt, &f.decoder, &short, &f.seq, &f.mel)
                .is_err()
        );
    }
}
