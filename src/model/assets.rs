//! Pretrained asset resolution.
//!
//! Files are looked up under a local directory when one is given, otherwise
//! fetched (and cached) from the HuggingFace Hub.

use std::path::{Path, PathBuf};

use candle_core::Device;
use hf_hub::api::sync::Api;

use super::speaker::SpeakerStats;
use super::tokenizer::TextTokenizer;
use crate::config::{AssetConfig, GptConfig};
use crate::{Error, Result};

/// Key of the packed statistics tensor in the `spk_stat` file.
pub(crate) const SPK_STAT_KEY: &str = "spk_stat";

#[derive(Debug, Clone)]
pub enum AssetSource {
    Local(PathBuf),
    Hub,
}

#[derive(Debug, Clone)]
pub struct Assets {
    config: AssetConfig,
    source: AssetSource,
}

impl Assets {
    pub fn new(config: AssetConfig, local_root: Option<&Path>) -> Self {
        let source = match local_root {
            Some(root) => AssetSource::Local(root.to_path_buf()),
            None => AssetSource::Hub,
        };
        Self { config, source }
    }

    pub fn config(&self) -> &AssetConfig {
        &self.config
    }

    /// Absolute path of a file relative to the asset root.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        match &self.source {
            AssetSource::Local(root) => {
                let path = root.join(relative);
                if !path.exists() {
                    return Err(Error::WeightLoad(format!(
                        "asset not found: {}",
                        path.display()
                    )));
                }
                Ok(path)
            }
            AssetSource::Hub => {
                tracing::debug!("fetching {}:{relative}", self.config.repo_id);
                let api = Api::new()?;
                let repo = api.model(self.config.repo_id.clone());
                Ok(repo.get(relative)?)
            }
        }
    }

    /// GPT shape from the backbone `config.json`, or the defaults when the
    /// asset set has none.
    pub fn gpt_config(&self) -> Result<GptConfig> {
        match self.resolve(&self.config.gpt_config) {
            Ok(path) => GptConfig::default().with_llama_json(path),
            Err(e) => {
                tracing::warn!("using default GPT config ({e})");
                Ok(GptConfig::default())
            }
        }
    }

    pub fn tokenizer(&self) -> Result<TextTokenizer> {
        TextTokenizer::from_file(self.resolve(&self.config.tokenizer)?)
    }

    /// Pretrained speaker statistics, or `None` when the asset cannot be
    /// resolved. A file that resolves but is malformed is an error.
    pub fn speaker_stats(&self, dim: usize, device: &Device) -> Result<Option<SpeakerStats>> {
        let path = match self.resolve(&self.config.spk_stat) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("no speaker statistics: {e}");
                return Ok(None);
            }
        };
        let tensors = candle_core::safetensors::load(&path, device)?;
        let packed = tensors.get(SPK_STAT_KEY).ok_or_else(|| {
            Error::WeightLoad(format!("{}: no {SPK_STAT_KEY} tensor", path.display()))
        })?;
        let stats = SpeakerStats::from_packed(packed)?;
        if stats.dim()? != dim {
            return Err(Error::WeightLoad(format!(
                "speaker statistics have dim {}, GPT hidden size is {dim}",
                stats.dim()?
            )));
        }
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};
    use std::collections::HashMap;

    #[test]
    fn local_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("asset")).unwrap();
        std::fs::write(dir.path().join("asset/x.bin"), b"x").unwrap();
        let assets = Assets::new(AssetConfig::default(), Some(dir.path()));
        assert!(assets.resolve("asset/x.bin").is_ok());
        assert!(assets.resolve("asset/missing.bin").is_err());
        // No config.json locally: defaults.
        assert_eq!(assets.gpt_config().unwrap(), GptConfig::default());
    }

    #[test]
    fn speaker_stats_from_file_or_none() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let assets = Assets::new(AssetConfig::default(), Some(dir.path()));

        assert!(assets.speaker_stats(4, &device).unwrap().is_none());

        std::fs::create_dir_all(dir.path().join("asset")).unwrap();
        let packed = Tensor::new(&[0.5f32, 0.5, 0.5, 0.5, 1.0, 1.0, 1.0, 1.0], &device).unwrap();
        candle_core::safetensors::save(
            &HashMap::from([(SPK_STAT_KEY.to_string(), packed)]),
            dir.path().join("asset/spk_stat.safetensors"),
        )
        .unwrap();
        let stats = assets.speaker_stats(4, &device).unwrap().unwrap();
        assert_eq!(stats.mean.to_vec1::<f32>().unwrap(), vec![1.0; 4]);
        assert_eq!(stats.std.dtype(), DType::F32);
        assert!(assets.speaker_stats(3, &device).is_err());
    }
}
