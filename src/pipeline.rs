//! End-to-end fine-tuning run.
//!
//! Orchestrates one run:
//! 1. Resolve pretrained assets (local directory or HF Hub)
//! 2. Open the dataset and tokenize transcripts
//! 3. Build the models the stage needs and load pretrained weights
//! 4. Apply per-module checkpoint overrides, then merge a speaker archive
//! 5. Train every epoch
//! 6. Merge adapters and save the trained modules

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{AssetConfig, DecoderConfig, EncoderConfig, GptConfig, TrainingConfig, VqConfig};
use crate::data::{AudioDataset, DatasetOptions, Loader};
use crate::model::assets::Assets;
use crate::model::gpt::BACKBONE_PREFIX;
use crate::model::lora::is_lora_param;
use crate::model::{Dvae, DvaeEncoder, Gpt, ParamStore, SpeakerEmbeddings, SpeakerStats};
use crate::train::{
    AutoencoderStage, CodecModels, DecoderType, SequenceModels, SequenceStage, Stage, TrainModule,
    Trainer,
};
use crate::{Error, Result};

/// Previously saved weights to start from.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPaths {
    pub decoder_encoder: Option<PathBuf>,
    pub decoder_decoder: Option<PathBuf>,
    pub dvae_encoder: Option<PathBuf>,
    pub dvae_decoder: Option<PathBuf>,
    pub gpt: Option<PathBuf>,
    pub speaker_embeds: Option<PathBuf>,
}

/// Codec shapes; the GPT shape comes from the asset `config.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfigs {
    pub decoder: DecoderConfig,
    pub dvae: DecoderConfig,
    pub vq: VqConfig,
}

impl Default for CodecConfigs {
    fn default() -> Self {
        Self {
            decoder: DecoderConfig::decoder(),
            dvae: DecoderConfig::dvae(),
            vq: VqConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub local_path: Option<PathBuf>,
    pub data_path: PathBuf,
    pub dataset: DatasetOptions,
    pub train_module: TrainModule,
    pub decoder_type: DecoderType,
    pub checkpoints: CheckpointPaths,
    pub save_folder: PathBuf,
    pub assets: AssetConfig,
    pub codecs: CodecConfigs,
    pub training: TrainingConfig,
}

impl RunConfig {
    pub fn new(data_path: impl Into<PathBuf>, train_module: TrainModule) -> Self {
        Self {
            local_path: None,
            data_path: data_path.into(),
            dataset: DatasetOptions::default(),
            train_module,
            decoder_type: DecoderType::Decoder,
            checkpoints: CheckpointPaths::default(),
            save_folder: PathBuf::from("./"),
            assets: AssetConfig::default(),
            codecs: CodecConfigs::default(),
            training: TrainingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        if !self.data_path.is_file() {
            return Err(Error::Config(format!(
                "data path {} is not a file",
                self.data_path.display()
            )));
        }
        if self.training.gpt_lora
            && !matches!(self.train_module, TrainModule::GptSpeaker | TrainModule::Gpt)
        {
            tracing::warn!("--gpt_lora has no effect when training {}", self.train_module);
        }
        if self.training.train_text && self.train_module.stage() != Stage::Sequence {
            tracing::warn!("--train_text has no effect when training {}", self.train_module);
        }
        Ok(())
    }

    fn uses_lora(&self) -> bool {
        self.training.gpt_lora && matches!(self.train_module, TrainModule::GptSpeaker | TrainModule::Gpt)
    }
}

/// A module written at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Gpt,
    SpeakerEmbeds,
    Encoder(DecoderType),
    Decoder(DecoderType),
}

impl Artifact {
    pub fn file_name(self) -> String {
        match self {
            Artifact::Gpt => "gpt.safetensors".into(),
            Artifact::SpeakerEmbeds => "speaker_embeds.npz".into(),
            Artifact::Encoder(kind) => format!("{kind}_encoder.safetensors"),
            Artifact::Decoder(kind) => format!("{kind}_decoder.safetensors"),
        }
    }
}

/// Modules a run saves, by what it trained.
pub fn artifacts(module: TrainModule, decoder_type: DecoderType) -> Vec<Artifact> {
    let plan = module.plan();
    let mut out = Vec::new();
    if plan.gpt {
        out.push(Artifact::Gpt);
    }
    if plan.speaker {
        out.push(Artifact::SpeakerEmbeds);
    }
    if plan.encoder {
        out.push(Artifact::Encoder(decoder_type));
    }
    if plan.decoder {
        out.push(Artifact::Decoder(decoder_type));
    }
    out
}

/// A codec encoder/decoder pair and their stores.
struct Codec {
    encoder_store: ParamStore,
    encoder: DvaeEncoder,
    decoder_store: ParamStore,
    decoder: Dvae,
}

struct GptParts {
    store: ParamStore,
    gpt: Gpt,
}

pub struct FinetunePipeline {
    config: RunConfig,
    assets: Assets,
    device: Device,
}

impl FinetunePipeline {
    pub fn new(config: RunConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let assets = Assets::new(config.assets.clone(), config.local_path.as_deref());
        Ok(Self {
            config,
            assets,
            device,
        })
    }

    /// Train and save; returns the written files.
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        let cfg = &self.config;
        // The CPU backend cannot be seeded; loader and speaker draws use their own rngs.
        if let (Some(seed), false) = (cfg.training.seed, self.device.is_cpu()) {
            self.device.set_seed(seed)?;
        }
        tracing::info!(
            "training {} on {} ({:?})",
            cfg.train_module,
            cfg.data_path.display(),
            self.device
        );

        let tokenizer = self.assets.tokenizer()?;
        let spk_emb_id = tokenizer.spk_emb_id();
        let dataset = AudioDataset::open(&cfg.data_path, tokenizer, &cfg.dataset)?;
        tracing::info!(
            "{} samples from {} speakers",
            dataset.len(),
            dataset.speakers().len()
        );
        let speakers = dataset.speakers();
        let dataset = Arc::new(dataset);
        let mut loader = Loader::new(
            Arc::clone(&dataset),
            cfg.training.batch_size,
            cfg.training.prefetch,
            cfg.training.seed,
        );

        match cfg.train_module.stage() {
            Stage::Sequence => {
                let gpt_config = self.assets.gpt_config()?;
                let mut gpt = self.build_gpt(&gpt_config)?;
                let dvae = self.build_codec(DecoderType::Dvae, dataset.n_mels())?;
                let decoder = self.build_codec(DecoderType::Decoder, dataset.n_mels())?;
                let table = self.build_speakers(&gpt_config, &speakers)?;

                {
                    let stage = SequenceStage::new(
                        cfg.train_module,
                        SequenceModels {
                            gpt: &gpt.gpt,
                            gpt_store: &gpt.store,
                            speakers: &table,
                            dvae_encoder: &dvae.encoder,
                            dvae: &dvae.decoder,
                            decoder: &decoder.decoder,
                        },
                        spk_emb_id,
                        &cfg.training,
                    )?;
                    Trainer::new(&stage, &cfg.training, &self.device)?.fit(&mut loader)?;
                }

                gpt.gpt.merge_lora(&gpt.store)?;
                self.save(Some(&gpt.store), Some(&table), None)
            }
            Stage::Autoencoder => {
                let codec = self.build_codec(cfg.decoder_type, dataset.n_mels())?;
                {
                    let stage = AutoencoderStage::new(
                        cfg.train_module,
                        CodecModels {
                            encoder: &codec.encoder,
                            encoder_store: &codec.encoder_store,
                            decoder: &codec.decoder,
                            decoder_store: &codec.decoder_store,
                        },
                        &cfg.training,
                    )?;
                    Trainer::new(&stage, &cfg.training, &self.device)?.fit(&mut loader)?;
                }
                self.save(None, None, Some(&codec))
            }
        }
    }

    fn build_gpt(&self, gpt_config: &GptConfig) -> Result<GptParts> {
        let cfg = &self.config;
        let lora = cfg.uses_lora().then_some(&cfg.training.lora);
        let store = ParamStore::new(DType::F32, &self.device);
        let gpt = Gpt::new(gpt_config, lora, store.var_builder())?;

        let backbone_path = self.assets.resolve(&self.assets.config().gpt_backbone)?;
        let embed_path = self.assets.resolve(&self.assets.config().gpt_embed)?;
        let backbone = store.load_safetensors(&backbone_path, BACKBONE_PREFIX)?;
        let embed = store.load_safetensors(&embed_path, "")?;
        let missing: Vec<String> = embed
            .missing
            .into_iter()
            .filter(|n| backbone.missing.contains(n))
            .collect();
        warn_missing("gpt", &missing, |n| !is_lora_param(n));
        tracing::info!("gpt: {} pretrained tensors", backbone.loaded + embed.loaded);

        if let Some(path) = &cfg.checkpoints.gpt {
            load_override(&store, path, is_lora_param)?;
        }
        if lora.is_some() {
            tracing::info!(
                "gpt: low-rank adapters on {}",
                cfg.training.lora.target_modules.join(", ")
            );
        }
        Ok(GptParts { store, gpt })
    }

    fn build_codec(&self, kind: DecoderType, n_mels: usize) -> Result<Codec> {
        let cfg = &self.config;
        let (decoder_cfg, vq, asset, encoder_ckpt, decoder_ckpt) = match kind {
            DecoderType::Decoder => (
                &cfg.codecs.decoder,
                None,
                &self.assets.config().decoder,
                &cfg.checkpoints.decoder_encoder,
                &cfg.checkpoints.decoder_decoder,
            ),
            DecoderType::Dvae => (
                &cfg.codecs.dvae,
                Some(&cfg.codecs.vq),
                &self.assets.config().dvae,
                &cfg.checkpoints.dvae_encoder,
                &cfg.checkpoints.dvae_decoder,
            ),
        };
        if decoder_cfg.n_mels != n_mels {
            return Err(Error::Config(format!(
                "{kind} decodes {} mel bins, dataset produces {n_mels}",
                decoder_cfg.n_mels
            )));
        }

        let decoder_store = ParamStore::new(DType::F32, &self.device);
        let decoder = Dvae::new(decoder_cfg, vq, decoder_store.var_builder())?;
        let report = decoder_store.load_safetensors(self.assets.resolve(asset)?, "")?;
        warn_missing(kind.as_str(), &report.missing, |_| true);

        // Encoders start from scratch unless a checkpoint is given.
        let encoder_store = ParamStore::new(DType::F32, &self.device);
        let encoder = DvaeEncoder::new(&EncoderConfig::for_decoder(decoder_cfg), encoder_store.var_builder())?;

        if let Some(path) = encoder_ckpt {
            encoder_store.load_checkpoint(path)?;
            tracing::info!("{kind} encoder from {}", path.display());
        }
        if let Some(path) = decoder_ckpt {
            decoder_store.load_checkpoint(path)?;
            tracing::info!("{kind} decoder from {}", path.display());
        }
        Ok(Codec {
            encoder_store,
            encoder,
            decoder_store,
            decoder,
        })
    }

    fn build_speakers(&self, gpt_config: &GptConfig, speakers: &[String]) -> Result<SpeakerEmbeddings> {
        let dim = gpt_config.hidden_size;
        let table = SpeakerEmbeddings::new(dim, &self.device);
        let archive = self.config.checkpoints.speaker_embeds.as_ref();
        if let Some(path) = archive {
            let merged = table.merge(SpeakerEmbeddings::load_npz(path)?)?;
            tracing::info!("{merged} speaker embeddings from {}", path.display());
        }

        let new = table.missing(speakers)?;
        let Some(first) = new.first() else {
            return Ok(table);
        };
        let stats = match (self.assets.speaker_stats(dim, &self.device)?, archive) {
            (Some(stats), _) => stats,
            (None, Some(_)) => {
                tracing::warn!("sampling {} new speakers from N(0, 1)", new.len());
                SpeakerStats::unit(dim, &self.device)?
            }
            (None, None) => {
                return Err(Error::WeightLoad(format!(
                    "no speaker statistics ({}) to initialize {} new speakers (first: {first}); \
                     provide the asset or a speaker embeddings archive",
                    self.assets.config().spk_stat,
                    new.len()
                )));
            }
        };
        let mut rng = match self.config.training.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let created = table.init_speakers(&new, &stats, &mut rng)?;
        tracing::info!("{created} new speaker embeddings");
        Ok(table)
    }

    fn save(
        &self,
        gpt: Option<&ParamStore>,
        speakers: Option<&SpeakerEmbeddings>,
        codec: Option<&Codec>,
    ) -> Result<Vec<PathBuf>> {
        let cfg = &self.config;
        std::fs::create_dir_all(&cfg.save_folder)?;
        tracing::debug!("saving into {}", cfg.save_folder.display());
        let mut written = Vec::new();
        for artifact in artifacts(cfg.train_module, cfg.decoder_type) {
            let path = cfg.save_folder.join(artifact.file_name());
            match (artifact, gpt, speakers, codec) {
                (Artifact::Gpt, Some(store), _, _) => store.save(&path)?,
                (Artifact::SpeakerEmbeds, _, Some(table), _) => table.save_npz(&path)?,
                (Artifact::Encoder(_), _, _, Some(codec)) => codec.encoder_store.save(&path)?,
                (Artifact::Decoder(_), _, _, Some(codec)) => codec.decoder_store.save(&path)?,
                _ => {
                    return Err(Error::Config(format!(
                        "nothing to save for {}",
                        artifact.file_name()
                    )));
                }
            }
            tracing::debug!("wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn warn_missing(module: &str, missing: &[String], relevant: impl Fn(&str) -> bool) {
    let missing: Vec<&String> = missing.iter().filter(|n| relevant(n.as_str())).collect();
    if let Some(first) = missing.first() {
        tracing::warn!(
            "{module}: {} tensors not in pretrained weights (first: {first})",
            missing.len()
        );
    }
}

/// Load a saved GPT; adapter vars may be absent from the file.
fn load_override(store: &ParamStore, path: &Path, optional: impl Fn(&str) -> bool) -> Result<()> {
    let report = store.load_safetensors(path, "")?;
    let required: Vec<&String> = report.missing.iter().filter(|n| !optional(n.as_str())).collect();
    if let Some(first) = required.first() {
        return Err(Error::WeightLoad(format!(
            "{}: missing {} tensors (first: {first})",
            path.display(),
            required.len()
        )));
    }
    tracing::info!("loaded {} tensors from {}", report.loaded, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::tests::write_dummy_dataset;
    use crate::model::assets::SPK_STAT_KEY;
    use crate::model::tokenizer::tests::toy_tokenizer_json;
    use std::collections::HashMap;

    #[test]
    fn artifact_table() {
        use DecoderType::*;
        assert_eq!(
            artifacts(TrainModule::GptSpeaker, Decoder),
            vec![Artifact::Gpt, Artifact::SpeakerEmbeds]
        );
        assert_eq!(artifacts(TrainModule::Gpt, Dvae), vec![Artifact::Gpt]);
        assert_eq!(artifacts(TrainModule::Speaker, Dvae), vec![Artifact::SpeakerEmbeds]);
        assert_eq!(
            artifacts(TrainModule::Autoencoder, Dvae),
            vec![Artifact::Encoder(Dvae), Artifact::Decoder(Dvae)]
        );
        assert_eq!(artifacts(TrainModule::Encoder, Decoder), vec![Artifact::Encoder(Decoder)]);
        assert_eq!(artifacts(TrainModule::Decoder, Decoder), vec![Artifact::Decoder(Decoder)]);

        let names: Vec<String> = [
            Artifact::Gpt,
            Artifact::SpeakerEmbeds,
            Artifact::Encoder(Decoder),
            Artifact::Decoder(Dvae),
        ]
        .into_iter()
        .map(Artifact::file_name)
        .collect();
        assert_eq!(
            names,
            vec![
                "gpt.safetensors",
                "speaker_embeds.npz",
                "decoder_encoder.safetensors",
                "dvae_decoder.safetensors"
            ]
        );
    }

    /// 100-bin codec small enough for a CPU test.
    fn small_codec(n_layer: usize) -> DecoderConfig {
        DecoderConfig {
            idim: 8,
            odim: 8,
            hidden: 12,
            n_layer,
            bn_dim: 6,
            kernel: 7,
            dilation: 2,
            n_mels: 100,
        }
    }

    fn small_codecs() -> CodecConfigs {
        CodecConfigs {
            decoder: small_codec(1),
            dvae: small_codec(1),
            vq: VqConfig {
                dim: 16,
                levels: vec![3, 3],
                groups: 2,
                num_quantizers: 2,
            },
        }
    }

    /// Local asset directory holding randomly initialized weights in the
    /// pretrained layout.
    fn write_assets(root: &Path, codecs: &CodecConfigs) {
        let asset = root.join("asset");
        std::fs::create_dir_all(asset.join("gpt")).unwrap();
        std::fs::create_dir_all(asset.join("tokenizer")).unwrap();
        std::fs::write(asset.join("tokenizer/tokenizer.json"), toy_tokenizer_json()).unwrap();
        let stat: Vec<f32> = [vec![0.5f32; 16], vec![1.0f32; 16]].concat();
        candle_core::safetensors::save(
            &HashMap::from([(
                SPK_STAT_KEY.to_string(),
                candle_core::Tensor::from_vec(stat, 32, &Device::Cpu).unwrap(),
            )]),
            asset.join("spk_stat.safetensors"),
        )
        .unwrap();
        std::fs::write(
            asset.join("gpt/config.json"),
            r#"{"hidden_size":16,"intermediate_size":32,"vocab_size":100,
                "num_hidden_layers":1,"num_attention_heads":4,"num_key_value_heads":2,
                "rms_norm_eps":1e-6,"max_position_embeddings":256}"#,
        )
        .unwrap();

        let device = Device::Cpu;
        let cfg = GptConfig::default().with_llama_json(asset.join("gpt/config.json")).unwrap();
        let store = ParamStore::new(DType::F32, &device);
        Gpt::new(&cfg, None, store.var_builder()).unwrap();
        let (backbone, embed): (HashMap<String, _>, HashMap<String, _>) = store
            .snapshot()
            .unwrap()
            .into_iter()
            .partition(|(name, _)| name.starts_with(BACKBONE_PREFIX));
        let backbone: HashMap<String, _> = backbone
            .into_iter()
            .map(|(name, t)| (name[BACKBONE_PREFIX.len()..].to_string(), t))
            .collect();
        candle_core::safetensors::save(&backbone, asset.join("gpt/model.safetensors")).unwrap();
        candle_core::safetensors::save(&embed, asset.join("Embed.safetensors")).unwrap();

        let decoder = ParamStore::new(DType::F32, &device);
        Dvae::new(&codecs.decoder, None, decoder.var_builder()).unwrap();
        decoder.save(asset.join("Decoder.safetensors")).unwrap();
        let dvae = ParamStore::new(DType::F32, &device);
        Dvae::new(&codecs.dvae, Some(&codecs.vq), dvae.var_builder()).unwrap();
        dvae.save(asset.join("DVAE.safetensors")).unwrap();
    }

    fn run_config(root: &Path, module: TrainModule) -> RunConfig {
        let data = root.join("data");
        std::fs::create_dir_all(&data).unwrap();
        let list = write_dummy_dataset(&data);
        let mut config = RunConfig::new(list, module);
        config.local_path = Some(root.to_path_buf());
        config.save_folder = root.join("out");
        config.codecs = small_codecs();
        config.training = TrainingConfig::default()
            .with_batch_size(2)
            .with_epochs(1)
            .with_seed(Some(1));
        config
    }

    #[test]
    fn speaker_run_saves_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_assets(dir.path(), &small_codecs());
        let config = run_config(dir.path(), TrainModule::Speaker);
        let written = FinetunePipeline::new(config, Device::Cpu).unwrap().run().unwrap();
        assert_eq!(written, vec![dir.path().join("out/speaker_embeds.npz")]);

        let table = SpeakerEmbeddings::load_npz(&written[0]).unwrap();
        let mut speakers: Vec<&String> = table.keys().collect();
        speakers.sort();
        assert_eq!(speakers, vec!["speaker_A", "speaker_B"]);
        assert_eq!(table["speaker_A"].dims(), &[16]);
    }

    #[test]
    fn lora_run_saves_merged_gpt() {
        let dir = tempfile::tempdir().unwrap();
        write_assets(dir.path(), &small_codecs());
        let mut config = run_config(dir.path(), TrainModule::Gpt);
        config.training = config.training.with_gpt_lora(true).with_train_text(true);
        let written = FinetunePipeline::new(config, Device::Cpu).unwrap().run().unwrap();
        assert_eq!(written, vec![dir.path().join("out/gpt.safetensors")]);

        let saved = candle_core::safetensors::load(&written[0], &Device::Cpu).unwrap();
        assert!(saved.keys().all(|k| !is_lora_param(k)));
        assert!(saved.contains_key("gpt.layers.0.self_attn.q_proj.weight"));
        assert!(saved.contains_key("head_code.3.weight_v"));
    }

    #[test]
    fn autoencoder_run_saves_pair_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        write_assets(dir.path(), &small_codecs());
        let mut config = run_config(dir.path(), TrainModule::Autoencoder);
        config.decoder_type = DecoderType::Dvae;
        let written = FinetunePipeline::new(config.clone(), Device::Cpu)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("out/dvae_encoder.safetensors"),
                dir.path().join("out/dvae_decoder.safetensors")
            ]
        );

        // A second run can start from the saved pair.
        config.train_module = TrainModule::Encoder;
        config.checkpoints.dvae_encoder = Some(written[0].clone());
        config.checkpoints.dvae_decoder = Some(written[1].clone());
        config.save_folder = dir.path().join("out2");
        let again = FinetunePipeline::new(config, Device::Cpu).unwrap().run().unwrap();
        assert_eq!(again, vec![dir.path().join("out2/dvae_encoder.safetensors")]);
    }

    #[test]
    fn seeded_speaker_init_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_assets(dir.path(), &small_codecs());
        let config = run_config(dir.path(), TrainModule::Speaker);
        let pipeline = FinetunePipeline::new(config, Device::Cpu).unwrap();
        let gpt_config = pipeline.assets.gpt_config().unwrap();
        let speakers = vec!["speaker_A".to_string(), "speaker_B".to_string()];

        let first = pipeline.build_speakers(&gpt_config, &speakers).unwrap();
        let second = pipeline.build_speakers(&gpt_config, &speakers).unwrap();
        let a = first.store().snapshot().unwrap();
        let b = second.store().snapshot().unwrap();
        for speaker in &speakers {
            let x: Vec<f32> = a[speaker].to_vec1().unwrap();
            let y: Vec<f32> = b[speaker].to_vec1().unwrap();
            assert_eq!(x, y);
            // Drawn around the pretrained mean of 1.0.
            let mean = x.iter().sum::<f32>() / x.len() as f32;
            assert!((mean - 1.0).abs() < 0.75);
        }
    }

    #[test]
    fn new_speakers_need_statistics_or_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_assets(dir.path(), &small_codecs());
        std::fs::remove_file(dir.path().join("asset/spk_stat.safetensors")).unwrap();
        let mut config = run_config(dir.path(), TrainModule::Speaker);
        let err = FinetunePipeline::new(config.clone(), Device::Cpu)
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::WeightLoad(_)));

        // An archive covering every speaker needs no statistics.
        let archive = dir.path().join("speakers.npz");
        let table = SpeakerEmbeddings::new(16, &Device::Cpu);
        table
            .merge(HashMap::from([
                ("speaker_A".to_string(), candle_core::Tensor::ones(16, DType::F32, &Device::Cpu).unwrap()),
                ("speaker_B".to_string(), candle_core::Tensor::ones(16, DType::F32, &Device::Cpu).unwrap()),
            ]))
            .unwrap();
        table.save_npz(&archive).unwrap();
        config.checkpoints.speaker_embeds = Some(archive);
        let written = FinetunePipeline::new(config, Device::Cpu).unwrap().run().unwrap();
        assert_eq!(written, vec![dir.path().join("out/speaker_embeds.npz")]);
    }

    #[test]
    fn mel_bins_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let mut codecs = small_codecs();
        codecs.decoder.n_mels = 80;
        write_assets(dir.path(), &codecs);
        let mut config = run_config(dir.path(), TrainModule::Decoder);
        config.codecs = codecs;
        let err = FinetunePipeline::new(config, Device::Cpu).unwrap().run().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_data_is_a_config_error() {
        let config = RunConfig::new("/nonexistent/list.list", TrainModule::Gpt);
        assert!(matches!(
            FinetunePipeline::new(config, Device::Cpu),
            Err(Error::Config(_))
        ));
    }
}
