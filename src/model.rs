//! Model components for ChatTTS fine-tuning.
//!
//! ## Components
//!
//! - [`gpt`]: token predictor: embeddings, weight-normed heads, [`llama`] backbone
//! - [`lora`]: low-rank adapters for the backbone projections
//! - [`dvae`]: ConvNeXt codec decoder (latent → mel), optionally with a quantizer
//! - [`encoder`]: mel → latent encoder paired with a codec decoder
//! - [`quantizer`]: grouped residual FSQ
//! - [`speaker`]: per-speaker embedding table
//! - [`params`]: named parameter stores backing every module
//! - [`tokenizer`], [`assets`]: transcript tokenizer and pretrained file lookup

pub mod assets;
pub mod dvae;
pub mod encoder;
pub mod gpt;
pub mod llama;
pub mod lora;
pub mod params;
pub mod quantizer;
pub mod speaker;
pub mod tokenizer;

pub use dvae::Dvae;
pub use encoder::DvaeEncoder;
pub use gpt::Gpt;
pub use params::ParamStore;
pub use quantizer::GroupedResidualFsq;
pub use speaker::{SpeakerEmbeddings, SpeakerStats};
pub use tokenizer::TextTokenizer;
