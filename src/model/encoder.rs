//! Mel → latent encoder paired with a [`Dvae`](super::dvae::Dvae) stage.
//!
//! Mirrors the decoder: a ConvNeXt stack runs at mel frame rate, then pairs of
//! frames are unfolded into channels so the latent has one step per audio
//! token and exactly the width the paired decoder folds back.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::dvae::{ConvNeXtStack, StackDims, unfold_frames};
use crate::config::EncoderConfig;

#[derive(Debug, Clone)]
pub struct DvaeEncoder {
    encoder: ConvNeXtStack,
    audio_dim: usize,
}

impl DvaeEncoder {
    pub fn new(cfg: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let dims = StackDims {
            idim: cfg.n_mels,
            odim: cfg.odim,
            hidden: cfg.hidden,
            n_layer: cfg.n_layer,
            bn_dim: cfg.bn_dim,
            kernel: cfg.kernel,
            dilation: cfg.dilation,
        };
        Ok(Self {
            encoder: ConvNeXtStack::new(dims, vb.pp("encoder"))?,
            audio_dim: cfg.audio_dim(),
        })
    }

    pub fn audio_dim(&self) -> usize {
        self.audio_dim
    }

    /// - `mel`: `[B, 2T, n_mels]`
    /// - `audio_mask`: `[B, T]` (1 = valid frame pair)
    ///
    /// Returns latents `[B, T, audio_dim]`, zero at padded steps.
    pub fn forward(&self, mel: &Tensor, audio_mask: &Tensor) -> Result<Tensor> {
        let mask = audio_mask.to_dtype(mel.dtype())?;
        let mel_mask = repeat_frames(&mask)?;
        let mel = mel.broadcast_mul(&mel_mask.unsqueeze(2)?)?;

        let hidden = self.encoder.forward(&mel.transpose(1, 2)?)?;
        let latents = unfold_frames(&hidden)?.transpose(1, 2)?;
        latents.broadcast_mul(&mask.unsqueeze(2)?)
    }
}

/// `[B, T]` audio mask → `[B, 2T]` mel-frame mask (each step covers two frames).
pub fn repeat_frames(mask: &Tensor) -> Result<Tensor> {
    let (b, t) = mask.dims2()?;
    mask.unsqueeze(2)?
        .broadcast_as((b, t, 2))?
        .contiguous()?
        .reshape((b, t * 2))
}

/// Float mel-frame mask for an integer audio mask.
pub fn mel_mask(audio_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    repeat_frames(&audio_mask.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::model::params::ParamStore;
    use candle_core::Device;

    #[test]
    fn repeat_doubles_each_step() {
        let mask = Tensor::new(&[[1u8, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap();
        let rows: Vec<Vec<u8>> = repeat_frames(&mask).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(rows[1], vec![1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn latents_match_decoder_width_and_mask() {
        let device = Device::Cpu;
        let store = ParamStore::new(DType::F32, &device);
        let decoder = DecoderConfig::tiny();
        let cfg = EncoderConfig::for_decoder(&decoder);
        let encoder = DvaeEncoder::new(&cfg, store.var_builder()).unwrap();
        assert_eq!(encoder.audio_dim(), decoder.input_dim());

        let mel = Tensor::randn(0f32, 1.0, (2, 8, decoder.n_mels), &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 1, 1], [1, 1, 0, 0]], &device).unwrap();
        let latents = encoder.forward(&mel, &mask).unwrap();
        assert_eq!(latents.dims(), &[2, 4, decoder.input_dim()]);

        let padded: f32 = latents
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(1, 2, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(padded, 0.0);
    }
}
