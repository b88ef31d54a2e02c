//! Audio + transcript dataset.
//!
//! Each list entry becomes a [`Sample`]:
//! - audio: wav → mono 24 kHz → log-mel `[2·audio_len, n_mels]`, zero-padded
//!   to an even frame count so every audio step covers two mel frames
//! - text: `[Stts][spk_emb]{text}[Ptts]` token ids
//!
//! Samples are either decoded up front in parallel or lazily on access.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use super::archive::TarArchive;
use super::list::{ListEntry, read_list};
use crate::audio::{self, MelConfig, MelSpectrogram};
use crate::model::TextTokenizer;
use crate::{Error, Result};

/// One preprocessed training example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub speaker: String,
    pub text_ids: Vec<u32>,
    /// Frame-major mel, `2 * audio_len` frames.
    pub mel: Vec<Vec<f32>>,
    pub audio_len: usize,
}

/// Where list entries' audio files are read from.
#[derive(Debug)]
pub enum AudioSource {
    /// Paths relative to a directory (absolute paths are used as is).
    Directory(PathBuf),
    Tar(TarArchive),
}

impl AudioSource {
    pub fn read(&self, filepath: &str) -> Result<Vec<u8>> {
        match self {
            AudioSource::Directory(root) => {
                let path = Path::new(filepath);
                let path = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    root.join(path)
                };
                std::fs::read(&path)
                    .map_err(|e| Error::Dataset(format!("{}: {e}", path.display())))
            }
            AudioSource::Tar(archive) => archive.read(filepath),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatasetOptions {
    pub tar_path: Option<PathBuf>,
    pub tar_in_memory: bool,
    pub process_ahead: bool,
    /// Keep only these speakers.
    pub speakers: Option<BTreeSet<String>>,
}

pub struct AudioDataset {
    entries: Vec<ListEntry>,
    source: AudioSource,
    tokenizer: TextTokenizer,
    mel: MelSpectrogram,
    processed: Option<Vec<Sample>>,
}

impl AudioDataset {
    /// Open a `.list`/`.json` file, reading audio from `opts.tar_path` or from
    /// the list file's directory.
    pub fn open(list_path: impl AsRef<Path>, tokenizer: TextTokenizer, opts: &DatasetOptions) -> Result<Self> {
        let list_path = list_path.as_ref();
        let mut entries = read_list(list_path)?;
        if let Some(keep) = &opts.speakers {
            entries.retain(|e| keep.contains(&e.speaker));
        }
        let source = match &opts.tar_path {
            Some(tar) => AudioSource::Tar(TarArchive::open(tar, opts.tar_in_memory)?),
            None => AudioSource::Directory(
                list_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
            ),
        };
        Self::new(entries, source, tokenizer, opts.process_ahead)
    }

    pub fn new(
        entries: Vec<ListEntry>,
        source: AudioSource,
        tokenizer: TextTokenizer,
        process_ahead: bool,
    ) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Dataset("dataset has no entries".into()));
        }
        let mut dataset = Self {
            entries,
            source,
            tokenizer,
            mel: MelSpectrogram::new(MelConfig::default()),
            processed: None,
        };
        if process_ahead {
            let start = std::time::Instant::now();
            let samples = dataset
                .entries
                .par_iter()
                .map(|entry| dataset.process(entry))
                .collect::<Result<Vec<_>>>()?;
            tracing::info!(
                "preprocessed {} samples in {:.1}s",
                samples.len(),
                start.elapsed().as_secs_f64()
            );
            dataset.processed = Some(samples);
        }
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_mels(&self) -> usize {
        self.mel.config().n_mels
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Sorted distinct speaker ids.
    pub fn speakers(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.speaker.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        if let Some(samples) = &self.processed {
            return samples
                .get(index)
                .cloned()
                .ok_or_else(|| Error::Dataset(format!("sample {index} out of range")));
        }
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| Error::Dataset(format!("sample {index} out of range")))?;
        self.process(entry)
    }

    fn process(&self, entry: &ListEntry) -> Result<Sample> {
        let bytes = self.source.read(&entry.filepath)?;
        let samples = audio::load_mono_24k(&bytes)
            .map_err(|e| Error::Dataset(format!("{}: {e}", entry.filepath)))?;

        let mut mel = self.mel.process(&samples);
        if mel.is_empty() {
            return Err(Error::Dataset(format!("{}: no audio frames", entry.filepath)));
        }
        let audio_len = mel.len().div_ceil(2);
        mel.resize(audio_len * 2, vec![0.0; self.n_mels()]);

        Ok(Sample {
            speaker: entry.speaker.clone(),
            text_ids: self.tokenizer.encode_prompt(&entry.text)?,
            mel,
            audio_len,
        })
    }
}
