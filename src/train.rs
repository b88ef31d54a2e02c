//! Fine-tuning loop: sequence assembly, loss routing and the two stages.
//!
//! ## Stages
//!
//! - [`gpt`]: GPT and/or speaker embeddings, scored with [`loss::LossRouter`]
//!   on sequences built by [`assembler::assemble`]
//! - [`autoencoder`]: codec encoder and/or decoder, scored on mel
//!   reconstruction
//!
//! Both implement [`driver::Objective`] and run under [`driver::Trainer`].
//! [`mode`] decides which modules a run optimizes.

pub mod assembler;
pub mod autoencoder;
pub mod driver;
pub mod gpt;
pub mod loss;
pub mod metrics;
pub mod mode;
pub mod optim;

pub use assembler::{AUDIO_EOS_ID, AUDIO_PAD_ID, AssembledSequence, IGNORE_INDEX, assemble};
pub use autoencoder::{AutoencoderStage, CodecModels};
pub use driver::{Objective, StepOutput, Trainer};
pub use gpt::{SequenceModels, SequenceStage};
pub use loss::{LossOutput, LossRouter, masked_cross_entropy};
pub use metrics::MetricLogger;
pub use mode::{DecoderType, Stage, TrainModule, TrainPlan};
pub use optim::{CosineAnnealing, GroupedOptimizer, ParamGroup, clip_grad_norm};
