//! Sequence stage: GPT and/or speaker embeddings against quantized audio.
//!
//! ```text
//! mel ─► dvae encoder ─► quantizer ─► audio ids ─┐   (frozen, detached)
//! text ids ──────────────────────────────────────┴► assemble ─► get_emb
//!     ─► inject speakers ─► backbone ─► LossRouter (heads + decoder)
//! ```

use candle_core::Tensor;

use super::assembler::assemble;
use super::driver::{Objective, StepOutput};
use super::loss::LossRouter;
use super::mode::{Stage, TrainModule, TrainPlan};
use super::optim::ParamGroup;
use crate::config::{AdamConfig, LearningRates, TrainingConfig};
use crate::data::Batch;
use crate::model::{Dvae, DvaeEncoder, Gpt, GroupedResidualFsq, ParamStore, SpeakerEmbeddings};
use crate::{Error, Result};

/// Models the sequence stage reads. Only the GPT and the speaker table can
/// train here.
pub struct SequenceModels<'a> {
    pub gpt: &'a Gpt,
    pub gpt_store: &'a ParamStore,
    pub speakers: &'a SpeakerEmbeddings,
    pub dvae_encoder: &'a DvaeEncoder,
    /// Codec carrying the quantizer that turns latents into audio ids.
    pub dvae: &'a Dvae,
    /// Hidden-state decoder for the reconstruction term.
    pub decoder: &'a Dvae,
}

pub struct SequenceStage<'a> {
    models: SequenceModels<'a>,
    quantizer: &'a GroupedResidualFsq,
    spk_emb_id: u32,
    router: LossRouter,
    plan: TrainPlan,
    rates: LearningRates,
}

impl<'a> SequenceStage<'a> {
    pub fn new(
        module: TrainModule,
        models: SequenceModels<'a>,
        spk_emb_id: u32,
        config: &TrainingConfig,
    ) -> Result<Self> {
        if module.stage() != Stage::Sequence {
            return Err(Error::Config(format!("{module} is not a sequence-stage module")));
        }
        let quantizer = models
            .dvae
            .quantizer()
            .ok_or_else(|| Error::Config("dvae has no quantizer to produce audio ids".into()))?;
        if models.dvae_encoder.audio_dim() != models.dvae.input_dim() {
            return Err(Error::Config(format!(
                "dvae encoder emits {} channels, quantizer expects {}",
                models.dvae_encoder.audio_dim(),
                models.dvae.input_dim()
            )));
        }
        if models.decoder.input_dim() != models.gpt.hidden_size() {
            return Err(Error::Config(format!(
                "decoder expects {} channels, gpt hidden size is {}",
                models.decoder.input_dim(),
                models.gpt.hidden_size()
            )));
        }
        if models.speakers.dim() != models.gpt.hidden_size() {
            return Err(Error::Config(format!(
                "speaker dim {} does not match gpt hidden size {}",
                models.speakers.dim(),
                models.gpt.hidden_size()
            )));
        }
        Ok(Self {
            models,
            quantizer,
            spk_emb_id,
            router: LossRouter::new(config.train_text, config.mse_weight),
            plan: module.plan(),
            rates: config.learning_rates,
        })
    }

    /// Quantized audio ids `[B, A, num_vq]` from the frozen dvae encoder.
    pub fn audio_ids(&self, batch: &Batch) -> Result<Tensor> {
        let latents = self
            .models
            .dvae_encoder
            .forward(&batch.audio_mel_specs, &batch.audio_attention_mask)?
            .detach();
        let (_, ids) = self.quantizer.quantize(&latents)?;
        let num_vq = ids.dim(2)?;
        if num_vq != self.models.gpt.num_vq() {
            return Err(Error::Config(format!(
                "quantizer yields {num_vq} codebooks, gpt expects {}",
                self.models.gpt.num_vq()
            )));
        }
        Ok(ids)
    }
}

impl Objective for SequenceStage<'_> {
    fn param_groups(&self) -> Result<Vec<ParamGroup>> {
        let mut groups = Vec::new();
        if self.plan.gpt {
            let gpt = self.models.gpt;
            let vars = self.models.gpt_store.vars_where(|name| gpt.is_trainable_param(name))?;
            groups.push(ParamGroup::new("gpt", vars, self.rates.gpt));
        }
        if self.plan.speaker {
            let lr = if self.plan.gpt {
                self.rates.speaker_joint
            } else {
                self.rates.speaker_only
            };
            let vars = self.models.speakers.store().all_vars()?;
            groups.push(ParamGroup::new("speaker", vars, lr));
        }
        Ok(groups)
    }

    fn adam(&self) -> AdamConfig {
        AdamConfig::sequence()
    }

    fn forward(&self, batch: &Batch) -> Result<StepOutput> {
        let gpt = self.models.gpt;
        let audio_ids = self.audio_ids(batch)?;
        let seq = assemble(
            &batch.text_input_ids,
            &batch.text_attention_mask,
            &audio_ids,
            &batch.audio_attention_mask,
        )?;

        let embeds = gpt.get_emb(&seq.input_ids, &seq.text_mask)?;
        let speakers = self.models.speakers.lookup(&batch.speakers)?;
        let embeds = gpt.inject_speakers(
            &embeds,
            &seq.input_ids,
            &seq.text_mask,
            self.spk_emb_id,
            &speakers,
        )?;
        let hidden = gpt.forward(&embeds, &seq.attention_mask)?;

        let losses = self.router.route(
            gpt,
            self.models.decoder,
            &hidden,
            &seq,
            &batch.audio_mel_specs,
        )?;
        Ok(StepOutput {
            meters: losses.meters()?,
            loss: losses.total,
        })
    }
}
