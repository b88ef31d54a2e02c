//! ChatTTS token predictor: embeddings and heads around the LLaMA backbone.
//!
//! Every sequence position carries `num_vq` id slots. Text positions repeat
//! one text id across the slots and are embedded with `emb_text`; audio
//! positions sum one `emb_code[i]` lookup per codebook. Outputs go through
//! weight-normalized heads: `head_text` for text and one `head_code[i]` per
//! codebook for audio.

use candle_core::{D, DType, Module, Result, Tensor};
use candle_nn::{Embedding, Init, Linear, VarBuilder};

use super::llama::Llama;
use super::lora::is_lora_param;
use super::params::ParamStore;
use crate::config::{GptConfig, LoraConfig};

/// Prefix of the backbone vars inside the GPT store.
pub const BACKBONE_PREFIX: &str = "gpt.";

/// Bias-free linear layer stored as `weight_g` `[out, 1]` and `weight_v`
/// `[out, in]`, with `W = g · v / ‖v‖` per output row.
#[derive(Debug, Clone)]
struct WeightNormLinear {
    weight_g: Tensor,
    weight_v: Tensor,
}

impl WeightNormLinear {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight_g: vb.get_with_hints((out_dim, 1), "weight_g", Init::Const(1.0))?,
            weight_v: vb.get_with_hints(
                (out_dim, in_dim),
                "weight_v",
                candle_nn::init::DEFAULT_KAIMING_NORMAL,
            )?,
        })
    }

    fn weight(&self) -> Result<Tensor> {
        let norm = self.weight_v.sqr()?.sum_keepdim(1)?.sqrt()?;
        self.weight_v.broadcast_div(&norm)?.broadcast_mul(&self.weight_g)
    }
}

impl Module for WeightNormLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Linear::new(self.weight()?, None).forward(x)
    }
}

#[derive(Debug, Clone)]
pub struct Gpt {
    gpt: Llama,
    emb_text: Embedding,
    emb_code: Vec<Embedding>,
    head_text: WeightNormLinear,
    head_code: Vec<WeightNormLinear>,
    num_vq: usize,
    hidden_size: usize,
    lora: bool,
}

impl Gpt {
    pub fn new(cfg: &GptConfig, lora: Option<&LoraConfig>, vb: VarBuilder) -> Result<Self> {
        let h = cfg.hidden_size;
        let emb_code = (0..cfg.num_vq)
            .map(|i| candle_nn::embedding(cfg.num_audio_tokens, h, vb.pp(format!("emb_code.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let head_code = (0..cfg.num_vq)
            .map(|i| WeightNormLinear::new(h, cfg.num_audio_tokens, vb.pp(format!("head_code.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            gpt: Llama::new(cfg, lora, vb.pp("gpt"))?,
            emb_text: candle_nn::embedding(cfg.num_text_tokens, h, vb.pp("emb_text"))?,
            emb_code,
            head_text: WeightNormLinear::new(h, cfg.num_text_tokens, vb.pp("head_text"))?,
            head_code,
            num_vq: cfg.num_vq,
            hidden_size: h,
            lora: lora.is_some(),
        })
    }

    pub fn num_vq(&self) -> usize {
        self.num_vq
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Input embeddings for mixed text/audio ids.
    ///
    /// - `input_ids`: `[B, S, num_vq]` (U32)
    /// - `text_mask`: `[B, S]` (1 = text position)
    pub fn get_emb(&self, input_ids: &Tensor, text_mask: &Tensor) -> Result<Tensor> {
        let (b, s, _) = input_ids.dims3()?;
        let text_mask = text_mask.to_dtype(DType::U8)?;

        let text_emb = self.emb_text.forward(&input_ids.narrow(2, 0, 1)?.squeeze(2)?)?;

        // Text ids are out of range for the code tables; zero them first.
        let audio_sel = text_mask.eq(0u8)?.to_dtype(DType::U32)?.unsqueeze(2)?;
        let code_ids = input_ids.broadcast_mul(&audio_sel)?;
        let mut code_emb = self.emb_code[0].forward(&code_ids.narrow(2, 0, 1)?.squeeze(2)?)?;
        for (i, emb) in self.emb_code.iter().enumerate().skip(1) {
            code_emb = (code_emb + emb.forward(&code_ids.narrow(2, i, 1)?.squeeze(2)?)?)?;
        }

        let select = text_mask
            .unsqueeze(2)?
            .broadcast_as((b, s, self.hidden_size))?
            .contiguous()?;
        select.where_cond(&text_emb, &code_emb)
    }

    /// Replace the embedding at every `[spk_emb]` text position of row `b`
    /// with `speakers[b]`.
    ///
    /// - `embeds`: `[B, S, H]`
    /// - `input_ids`: `[B, S, num_vq]`
    /// - `text_mask`: `[B, S]`; audio ids may collide with the marker id
    /// - `speakers`: `[B, H]`, already normalized
    pub fn inject_speakers(
        &self,
        embeds: &Tensor,
        input_ids: &Tensor,
        text_mask: &Tensor,
        spk_emb_token: u32,
        speakers: &Tensor,
    ) -> Result<Tensor> {
        let (b, s, h) = embeds.dims3()?;
        let at_marker = input_ids
            .narrow(2, 0, 1)?
            .squeeze(2)?
            .eq(spk_emb_token)?
            .mul(&text_mask.to_dtype(DType::U8)?.ne(0u8)?)?
            .unsqueeze(2)?
            .broadcast_as((b, s, h))?
            .contiguous()?;
        let speakers = speakers
            .to_dtype(embeds.dtype())?
            .unsqueeze(1)?
            .broadcast_as((b, s, h))?
            .contiguous()?;
        at_marker.where_cond(&speakers, embeds)
    }

    /// Backbone hidden states `[B, S, H]`.
    pub fn forward(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        self.gpt.forward(inputs_embeds, attention_mask)
    }

    /// `[.., H]` → `[.., num_text_tokens]`
    pub fn text_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        self.head_text.forward(hidden)
    }

    /// `[B, S, H]` → `[B, S, num_vq, num_audio_tokens]`
    pub fn audio_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = self
            .head_code
            .iter()
            .map(|head| head.forward(hidden))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&logits, D::Minus2)
    }

    pub fn has_lora(&self) -> bool {
        self.lora
    }

    /// Whether a var of this model is optimized. With adapters, the backbone
    /// base weights stay fixed while adapters, embeddings and heads train.
    pub fn is_trainable_param(&self, name: &str) -> bool {
        !self.lora || is_lora_param(name) || !name.starts_with(BACKBONE_PREFIX)
    }

    /// Fold adapters into the backbone and drop their vars from `store`.
    pub fn merge_lora(&mut self, store: &ParamStore) -> crate::Result<()> {
        if !self.lora {
            return Ok(());
        }
        self.gpt.merge_lora(store)?;
        let removed = store.remove_where(is_lora_param)?;
        tracing::info!("merged {removed} adapter tensors into the backbone");
        self.lora = false;
        Ok(())
    }
}
