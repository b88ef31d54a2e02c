//! ChatTTS fine-tuning CLI.
//!
//! Trains one module group (GPT, speaker embeddings, or a codec
//! encoder/decoder) on a `.list`/`.json` dataset and writes the trained
//! modules to --save_folder. Pretrained assets come from --local_path, or
//! from HuggingFace when it is omitted.
//!
//! # Output
//!
//! Prints the save directory to stdout on success:
//!
//! ```text
//! save models to: ./
//! ```

use std::path::PathBuf;

use chattts_finetune::{
    data::DatasetOptions,
    pipeline::{CheckpointPaths, FinetunePipeline, RunConfig},
    train::{DecoderType, TrainModule},
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "chattts-finetune",
    about = "Fine-tune ChatTTS modules on a speaker dataset",
    long_about = "Fine-tune the ChatTTS GPT, speaker embeddings or codec on a list of\n\
                  transcribed audio clips. Trained modules are written to --save_folder;\n\
                  the save directory is printed to stdout."
)]
struct Args {
    /// Local directory holding the pretrained `asset/` tree.
    /// Omit to download from HuggingFace.
    #[arg(long = "local_path")]
    local_path: Option<PathBuf>,

    /// Dataset list file (`.list` or `.json`).
    #[arg(long = "data_path", default_value = "dummy_data/xz_list_style/speaker_A.list")]
    data_path: PathBuf,

    /// Read audio from this tar archive instead of the filesystem.
    #[arg(long = "tar_path")]
    tar_path: Option<PathBuf>,

    /// Load the whole tar archive into memory.
    #[arg(long = "tar_in_memory")]
    tar_in_memory: bool,

    /// Preprocess every sample before training starts.
    #[arg(long = "process_ahead")]
    process_ahead: bool,

    #[arg(long = "train_module", value_enum, default_value_t = TrainModule::Gpt)]
    train_module: TrainModule,

    /// Codec trained by the encoder/decoder/autoencoder modules.
    #[arg(long = "decoder_type", value_enum, default_value_t = DecoderType::Decoder)]
    decoder_type: DecoderType,

    /// Add the text cross-entropy term.
    #[arg(long = "train_text")]
    train_text: bool,

    /// Train low-rank adapters instead of the full GPT backbone.
    #[arg(long = "gpt_lora")]
    gpt_lora: bool,

    #[arg(long = "decoder_encoder_path")]
    decoder_encoder_path: Option<PathBuf>,

    #[arg(long = "decoder_decoder_path")]
    decoder_decoder_path: Option<PathBuf>,

    #[arg(long = "dvae_encoder_path")]
    dvae_encoder_path: Option<PathBuf>,

    #[arg(long = "dvae_decoder_path")]
    dvae_decoder_path: Option<PathBuf>,

    #[arg(long = "gpt_path")]
    gpt_path: Option<PathBuf>,

    /// Speaker embeddings (`.npz`) merged over the sampled ones.
    #[arg(long = "speaker_embeds_path")]
    speaker_embeds_path: Option<PathBuf>,

    #[arg(long = "save_folder", default_value = "./")]
    save_folder: PathBuf,

    #[arg(long = "batch_size", default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Colored progress output.
    #[arg(long)]
    color: bool,

    /// Seed for shuffling and new speaker vectors.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Train on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

impl Args {
    fn into_config(self) -> RunConfig {
        let mut config = RunConfig::new(self.data_path, self.train_module);
        config.local_path = self.local_path;
        config.dataset = DatasetOptions {
            tar_path: self.tar_path,
            tar_in_memory: self.tar_in_memory,
            process_ahead: self.process_ahead,
            ..Default::default()
        };
        config.decoder_type = self.decoder_type;
        config.checkpoints = CheckpointPaths {
            decoder_encoder: self.decoder_encoder_path,
            decoder_decoder: self.decoder_decoder_path,
            dvae_encoder: self.dvae_encoder_path,
            dvae_decoder: self.dvae_decoder_path,
            gpt: self.gpt_path,
            speaker_embeds: self.speaker_embeds_path,
        };
        config.save_folder = self.save_folder;
        config.training = config
            .training
            .with_batch_size(self.batch_size)
            .with_epochs(self.epochs)
            .with_train_text(self.train_text)
            .with_gpt_lora(self.gpt_lora)
            .with_seed(self.seed)
            .with_color(self.color);
        config
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        candle_core::Device::cuda_if_available(0)?
    };
    tracing::info!("Using device: {:?}", device);

    let config = args.into_config();
    let save_folder = config.save_folder.clone();
    let pipeline = FinetunePipeline::new(config, device)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    let saved = pipeline
        .run()
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;
    tracing::info!("wrote {} files", saved.len());

    println!("save models to: {}", save_folder.display());
    Ok(())
}
