//! Trainable per-speaker embedding table.
//!
//! One var per speaker id. New speakers start from the pretrained speaker
//! distribution (`randn · std + mean`); a previously saved table can be
//! merged on top. The table persists as an `.npz` archive keyed by speaker id.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

use super::params::ParamStore;
use crate::{Error, Result};

/// Per-dimension statistics of the pretrained speaker embeddings.
#[derive(Debug, Clone)]
pub struct SpeakerStats {
    pub mean: Tensor,
    pub std: Tensor,
}

impl SpeakerStats {
    /// Split a packed `std ‖ mean` vector of length `2·dim`.
    pub fn from_packed(packed: &Tensor) -> Result<Self> {
        let len = packed.dims1()?;
        if len % 2 != 0 {
            return Err(Error::WeightLoad(format!(
                "speaker statistics have odd length {len}"
            )));
        }
        let packed = packed.to_dtype(DType::F32)?;
        Ok(Self {
            std: packed.narrow(0, 0, len / 2)?,
            mean: packed.narrow(0, len / 2, len / 2)?,
        })
    }

    /// Standard normal statistics.
    pub fn unit(dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: Tensor::zeros(dim, DType::F32, device)?,
            std: Tensor::ones(dim, DType::F32, device)?,
        })
    }

    pub fn dim(&self) -> Result<usize> {
        Ok(self.mean.dims1()?)
    }

    fn sample(&self, rng: &mut StdRng) -> Result<Tensor> {
        let dim = self.dim()?;
        let noise: Vec<f32> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
        let noise = Tensor::from_vec(noise, dim, self.mean.device())?;
        Ok(noise.mul(&self.std)?.add(&self.mean)?)
    }
}

pub struct SpeakerEmbeddings {
    store: ParamStore,
    dim: usize,
}

impl SpeakerEmbeddings {
    pub fn new(dim: usize, device: &Device) -> Self {
        Self {
            store: ParamStore::new(DType::F32, device),
            dim,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn store(&self) -> &ParamStore {
        &self.store
    }

    pub fn speakers(&self) -> Result<Vec<String>> {
        self.store.names()
    }

    pub fn contains(&self, speaker: &str) -> Result<bool> {
        Ok(self.store.get(speaker)?.is_some())
    }

    /// Speakers not yet in the table.
    pub fn missing<S: AsRef<str>>(&self, speakers: &[S]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for speaker in speakers {
            if !self.contains(speaker.as_ref())? {
                out.push(speaker.as_ref().to_string());
            }
        }
        Ok(out)
    }

    /// Sample a vector for each speaker not yet in the table, in `speakers` order.
    pub fn init_speakers<S: AsRef<str>>(
        &self,
        speakers: &[S],
        stats: &SpeakerStats,
        rng: &mut StdRng,
    ) -> Result<usize> {
        if stats.dim()? != self.dim {
            return Err(Error::Config(format!(
                "speaker statistics have dim {}, table expects {}",
                stats.dim()?,
                self.dim
            )));
        }
        let mut created = 0;
        for speaker in speakers {
            let speaker = speaker.as_ref();
            if self.contains(speaker)? {
                continue;
            }
            self.store.insert(speaker, &stats.sample(rng)?)?;
            created += 1;
        }
        Ok(created)
    }

    /// Insert supplied vectors unchanged, replacing existing entries.
    pub fn merge(&self, supplied: HashMap<String, Tensor>) -> Result<usize> {
        let mut merged = 0;
        for (speaker, vector) in supplied {
            let vector = vector.flatten_all()?;
            if vector.dims1()? != self.dim {
                return Err(Error::WeightLoad(format!(
                    "speaker {speaker} has dim {}, expected {}",
                    vector.dims1()?,
                    self.dim
                )));
            }
            self.store.insert(speaker, &vector)?;
            merged += 1;
        }
        Ok(merged)
    }

    /// L2-normalized vectors `[B, dim]` for a batch of speaker ids.
    pub fn lookup<S: AsRef<str>>(&self, speakers: &[S]) -> Result<Tensor> {
        let vectors = speakers
            .iter()
            .map(|s| {
                let s = s.as_ref();
                self.store
                    .get(s)?
                    .map(|v| v.as_tensor().clone())
                    .ok_or_else(|| Error::Dataset(format!("no embedding for speaker {s}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let stacked = Tensor::stack(&vectors, 0)?;
        let norm = stacked.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
        Ok(stacked.broadcast_div(&norm)?)
    }

    pub fn save_npz(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut entries: Vec<(String, Tensor)> = self.store.snapshot()?.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Tensor::write_npz(&entries, path)
            .map_err(|e| Error::WeightLoad(format!("saving {}: {e}", path.display())))
    }

    /// Read a table written by [`SpeakerEmbeddings::save_npz`].
    pub fn load_npz(path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>> {
        let path = path.as_ref();
        let entries = Tensor::read_npz(path)
            .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;
        Ok(entries.into_iter().collect())
    }
}
