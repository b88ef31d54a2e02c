//! Autoencoder stage: codec encoder and/or decoder against mel reconstruction.
//!
//! ```text
//! mel ─► encoder ─► latents · mask ─► [quantizer] ─► decoder ─► · mel mask ─► MSE(mel)
//! ```
//!
//! The quantizer only takes part when the decoder carries one (`dvae`); its
//! rounding is straight-through, so the encoder still receives gradients.

use candle_core::{DType, Module};

use super::driver::{Objective, StepOutput};
use super::mode::{Stage, TrainModule, TrainPlan};
use super::optim::ParamGroup;
use crate::config::{AdamConfig, LearningRates, TrainingConfig};
use crate::data::Batch;
use crate::model::encoder::mel_mask;
use crate::model::{Dvae, DvaeEncoder, ParamStore};
use crate::{Error, Result};

pub struct CodecModels<'a> {
    pub encoder: &'a DvaeEncoder,
    pub encoder_store: &'a ParamStore,
    pub decoder: &'a Dvae,
    pub decoder_store: &'a ParamStore,
}

pub struct AutoencoderStage<'a> {
    models: CodecModels<'a>,
    plan: TrainPlan,
    lr: f64,
}

impl<'a> AutoencoderStage<'a> {
    pub fn new(module: TrainModule, models: CodecModels<'a>, config: &TrainingConfig) -> Result<Self> {
        if module.stage() != Stage::Autoencoder {
            return Err(Error::Config(format!("{module} is not an autoencoder-stage module")));
        }
        if models.encoder.audio_dim() != models.decoder.input_dim() {
            return Err(Error::Config(format!(
                "encoder emits {} channels, decoder expects {}",
                models.encoder.audio_dim(),
                models.decoder.input_dim()
            )));
        }
        Ok(Self {
            models,
            plan: module.plan(),
            lr: Self::learning_rate(module, &config.learning_rates),
        })
    }

    fn learning_rate(module: TrainModule, rates: &LearningRates) -> f64 {
        match module {
            TrainModule::Encoder => rates.encoder_only,
            _ => rates.autoencoder,
        }
    }
}

impl Objective for AutoencoderStage<'_> {
    fn param_groups(&self) -> Result<Vec<ParamGroup>> {
        let mut groups = Vec::new();
        if self.plan.encoder {
            groups.push(ParamGroup::new(
                "encoder",
                self.models.encoder_store.all_vars()?,
                self.lr,
            ));
        }
        if self.plan.decoder {
            groups.push(ParamGroup::new(
                "decoder",
                self.models.decoder_store.vars_where(Dvae::is_trainable_param)?,
                self.lr,
            ));
        }
        Ok(groups)
    }

    fn adam(&self) -> AdamConfig {
        AdamConfig::autoencoder()
    }

    fn forward(&self, batch: &Batch) -> Result<StepOutput> {
        let mel = &batch.audio_mel_specs;
        let mut latents = self
            .models
            .encoder
            .forward(mel, &batch.audio_attention_mask)?;
        if !self.plan.encoder {
            latents = latents.detach();
        }
        if let Some(quantizer) = self.models.decoder.quantizer() {
            latents = quantizer.quantize(&latents)?.0;
        }

        let frames = mel_mask(&batch.audio_attention_mask, mel.dtype())?;
        let reconstructed = self
            .models
            .decoder
            .forward(&latents.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .broadcast_mul(&frames.unsqueeze(2)?)?;
        let loss = candle_nn::loss::mse(&reconstructed, mel)?;
        let value = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
        Ok(StepOutput {
            loss,
            meters: vec![("loss", value)],
        })
    }
}
