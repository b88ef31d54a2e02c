//! ChatTTS fine-tuning in pure Rust.
//!
//! A candle-based training pipeline for the ChatTTS GPT, its per-speaker
//! embeddings and the DVAE codec. Loads the released safetensors weights
//! directly and writes fine-tuned modules back in the same layout.
//!
//! ## Architecture
//!
//! One training step of the sequence stage:
//!
//! ```text
//! wav → mel ─► DVAE encoder ─► grouped FSQ ─► audio ids ──┐
//!                                                          ├→ assembled sequence
//! transcript → [Stts][spk_emb]…[Ptts] ─► text ids ────────┘
//!                                                          ↓
//!              embeddings (+ speaker vector at [spk_emb])
//!                                                          ↓
//!              LLaMA backbone (optional LoRA)
//!                                                          ↓
//!              audio CE  +  text CE (optional)  +  0.01 · mel MSE via decoder
//! ```
//!
//! The autoencoder stage trains a codec encoder and/or decoder on mel
//! reconstruction.
//!
//! ## Modules
//!
//! - [`audio`]: WAV I/O, resampling, log-mel spectrogram
//! - [`config`]: model, asset and training configuration
//! - [`data`]: list files, tar archives, preprocessing, batching
//! - [`model`]: GPT, LoRA, DVAE codec and encoder, FSQ, speaker table
//! - [`train`]: sequence assembly, loss routing, optimizer and epoch loop
//! - [`pipeline`]: end-to-end run: load, train, save

pub mod audio;
pub mod config;
pub mod data;
pub mod model;
pub mod pipeline;
pub mod train;

mod error;

pub use error::{Error, Result};
