//! Model and training configuration.
//!
//! Defaults match the pretrained ChatTTS release: a 20-layer LLaMA token
//! predictor over 4 parallel audio codebooks, and two ConvNeXt codec stages
//! (`decoder` for GPT hidden states, `dvae` for quantized audio features).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Token predictor
// ---------------------------------------------------------------------------

/// GPT (LLaMA backbone + ChatTTS embedding/head wrapper) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    /// Audio vocabulary per codebook (625 FSQ codes + end marker).
    pub num_audio_tokens: usize,
    pub num_text_tokens: usize,
    /// Parallel audio codebooks per time step.
    pub num_vq: usize,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 20,
            num_attention_heads: 12,
            num_key_value_heads: 12,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            max_position_embeddings: 4096,
            num_audio_tokens: 626,
            num_text_tokens: 21178,
            num_vq: 4,
        }
    }
}

impl GptConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Read the backbone shape from a HuggingFace `config.json` (LLaMA format),
    /// keeping the ChatTTS vocabulary sizes from `self`.
    pub fn with_llama_json(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let llama: candle_transformers::models::llama::LlamaConfig = serde_json::from_str(&raw)?;
        self.hidden_size = llama.hidden_size;
        self.intermediate_size = llama.intermediate_size;
        self.num_hidden_layers = llama.num_hidden_layers;
        self.num_attention_heads = llama.num_attention_heads;
        self.num_key_value_heads = llama
            .num_key_value_heads
            .unwrap_or(llama.num_attention_heads);
        self.rms_norm_eps = llama.rms_norm_eps;
        self.rope_theta = llama.rope_theta as f64;
        self.max_position_embeddings = llama.max_position_embeddings;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} not divisible by {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(Error::Config(format!(
                "{} attention heads not divisible by {} kv heads",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.hidden_size % 2 != 0 {
            return Err(Error::Config(
                "hidden_size must be even to fold into mel frames".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Codec stages
// ---------------------------------------------------------------------------

/// ConvNeXt codec decoder configuration (`DVAEDecoder` plus output conv).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Channels after folding the input (`input_dim / 2`).
    pub idim: usize,
    pub odim: usize,
    pub hidden: usize,
    pub n_layer: usize,
    pub bn_dim: usize,
    pub kernel: usize,
    pub dilation: usize,
    pub n_mels: usize,
}

impl DecoderConfig {
    /// GPT hidden states (768) → mel.
    pub fn decoder() -> Self {
        Self {
            idim: 384,
            odim: 384,
            hidden: 512,
            n_layer: 12,
            bn_dim: 128,
            kernel: 7,
            dilation: 2,
            n_mels: 100,
        }
    }

    /// Quantized features (1024) → mel.
    pub fn dvae() -> Self {
        Self {
            idim: 512,
            odim: 512,
            hidden: 256,
            n_layer: 12,
            bn_dim: 128,
            kernel: 7,
            dilation: 2,
            n_mels: 100,
        }
    }

    /// Width of the unfolded latent the decoder consumes.
    pub fn input_dim(&self) -> usize {
        self.idim * 2
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self::decoder()
    }
}

/// Grouped residual FSQ configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VqConfig {
    pub dim: usize,
    pub levels: Vec<usize>,
    /// Groups (G).
    pub groups: usize,
    /// Residual quantizers per group (R).
    pub num_quantizers: usize,
}

impl Default for VqConfig {
    fn default() -> Self {
        Self {
            dim: 1024,
            levels: vec![5, 5, 5, 5],
            groups: 2,
            num_quantizers: 2,
        }
    }
}

impl VqConfig {
    /// Number of id streams produced per time step (G·R).
    pub fn num_codebooks(&self) -> usize {
        self.groups * self.num_quantizers
    }

    /// Distinct codes per stream.
    pub fn codebook_size(&self) -> usize {
        self.levels.iter().product()
    }
}

/// Mel → latent encoder, mirroring a decoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub n_mels: usize,
    /// Channels before unfolding; latents are `2 * odim` wide.
    pub odim: usize,
    pub hidden: usize,
    pub n_layer: usize,
    pub bn_dim: usize,
    pub kernel: usize,
    pub dilation: usize,
}

impl EncoderConfig {
    /// Encoder whose latent width matches what `decoder` consumes.
    pub fn for_decoder(decoder: &DecoderConfig) -> Self {
        Self {
            n_mels: decoder.n_mels,
            odim: decoder.idim,
            hidden: decoder.hidden,
            n_layer: decoder.n_layer,
            bn_dim: decoder.bn_dim,
            kernel: decoder.kernel,
            dilation: decoder.dilation,
        }
    }

    /// Latent width produced per audio frame.
    pub fn audio_dim(&self) -> usize {
        self.odim * 2
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

/// Low-rank adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into(), "v_proj".into()],
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

/// Where pretrained files live, relative to a local root or HF repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub repo_id: String,
    pub gpt_config: String,
    /// Backbone weights, stored without the `gpt.` prefix.
    pub gpt_backbone: String,
    /// Embedding and head weights.
    pub gpt_embed: String,
    pub decoder: String,
    pub dvae: String,
    pub tokenizer: String,
    /// Safetensors file with a single `spk_stat` tensor (std ‖ mean).
    pub spk_stat: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            repo_id: "2Noise/ChatTTS".into(),
            gpt_config: "asset/gpt/config.json".into(),
            gpt_backbone: "asset/gpt/model.safetensors".into(),
            gpt_embed: "asset/Embed.safetensors".into(),
            decoder: "asset/Decoder.safetensors".into(),
            dvae: "asset/DVAE.safetensors".into(),
            tokenizer: "asset/tokenizer/tokenizer.json".into(),
            spk_stat: "asset/spk_stat.safetensors".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

/// Optimizer hyper-parameters shared by one training stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl AdamConfig {
    /// Plain Adam used for the sequence stage.
    pub fn sequence() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-5,
            weight_decay: 0.0,
        }
    }

    /// AdamW used for the autoencoder stage.
    pub fn autoencoder() -> Self {
        Self {
            beta1: 0.8,
            beta2: 0.99,
            eps: 1e-6,
            weight_decay: 0.01,
        }
    }
}

/// Base learning rates per parameter group and train module.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRates {
    /// GPT parameters in `gpt_speaker` and `gpt` modes.
    pub gpt: f64,
    /// Speaker table alongside the GPT (`gpt_speaker`).
    pub speaker_joint: f64,
    /// Speaker table alone (`speaker`).
    pub speaker_only: f64,
    /// `encoder` mode.
    pub encoder_only: f64,
    /// `autoencoder` and `decoder` modes.
    pub autoencoder: f64,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            gpt: 1e-3,
            speaker_joint: 1e-1,
            speaker_only: 1e-2,
            encoder_only: 1e-3,
            autoencoder: 1e-4,
        }
    }
}

/// Run-level training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Add the text cross-entropy term.
    pub train_text: bool,
    /// Wrap the GPT backbone with low-rank adapters.
    pub gpt_lora: bool,
    pub lora: LoraConfig,
    pub learning_rates: LearningRates,
    pub max_grad_norm: f64,
    /// Cosine schedule floor.
    pub min_lr: f64,
    /// Weight of the mel reconstruction term in the sequence stage.
    pub mse_weight: f64,
    /// Collated batches buffered ahead of the training thread.
    pub prefetch: usize,
    pub seed: Option<u64>,
    pub color: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 10,
            train_text: false,
            gpt_lora: false,
            lora: LoraConfig::default(),
            learning_rates: LearningRates::default(),
            max_grad_norm: 1.0,
            min_lr: 1e-7,
            mse_weight: 0.01,
            prefetch: 2,
            seed: None,
            color: false,
        }
    }
}

impl TrainingConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_train_text(mut self, train_text: bool) -> Self {
        self.train_text = train_text;
        self
    }

    pub fn with_gpt_lora(mut self, gpt_lora: bool) -> Self {
        self.gpt_lora = gpt_lora;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.epochs == 0 {
            return Err(Error::Config("epochs must be positive".into()));
        }
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
impl GptConfig {
    /// Small shape for unit tests.
    pub(crate) fn tiny() -> Self {
        Self {
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            max_position_embeddings: 64,
            num_audio_tokens: 10,
            num_text_tokens: 40,
            num_vq: 2,
        }
    }
}

#[cfg(test)]
impl DecoderConfig {
    /// Decoder consuming a 16-wide latent (GptConfig::tiny hidden size).
    pub(crate) fn tiny() -> Self {
        Self {
            idim: 8,
            odim: 8,
            hidden: 12,
            n_layer: 2,
            bn_dim: 6,
            kernel: 7,
            dilation: 2,
            n_mels: 10,
        }
    }
}

#[cfg(test)]
impl VqConfig {
    /// One group of two residual quantizers over 3x3 levels (9 codes).
    pub(crate) fn tiny() -> Self {
        Self {
            dim: 16,
            levels: vec![3, 3],
            groups: 1,
            num_quantizers: 2,
        }
    }
}
