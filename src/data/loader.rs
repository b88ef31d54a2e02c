//! Shuffling batch loader with background collation.
//!
//! ```text
//! worker thread: shuffle → chunk → dataset.get ×B → collate ─► bounded channel ─► training thread
//! ```
//!
//! The channel holds at most `prefetch` batches; the worker blocks when it is
//! full and the training thread blocks when it is empty. A worker error is
//! sent through the channel and ends the epoch.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, bounded};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::collator::{HostBatch, collate};
use super::dataset::AudioDataset;
use crate::{Error, Result};

pub struct Loader {
    dataset: Arc<AudioDataset>,
    batch_size: usize,
    prefetch: usize,
    rng: StdRng,
}

impl Loader {
    pub fn new(dataset: Arc<AudioDataset>, batch_size: usize, prefetch: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            dataset,
            batch_size: batch_size.max(1),
            prefetch: prefetch.max(1),
            rng,
        }
    }

    /// Batches per epoch; the last one may be short.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Start one shuffled pass over the dataset.
    pub fn epoch(&mut self) -> Result<EpochBatches> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        order.shuffle(&mut self.rng);

        let (tx, rx) = bounded(self.prefetch);
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.batch_size;
        let worker = std::thread::Builder::new()
            .name("batch-loader".into())
            .spawn(move || {
                let text_pad = dataset.tokenizer().pad_id();
                let n_mels = dataset.n_mels();
                for chunk in order.chunks(batch_size) {
                    let batch = chunk
                        .iter()
                        .map(|&i| dataset.get(i))
                        .collect::<Result<Vec<_>>>()
                        .and_then(|samples| collate(&samples, text_pad, n_mels));
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(EpochBatches {
            rx,
            remaining: self.num_batches(),
            _worker: worker,
        })
    }
}

/// Iterator over one epoch's collated batches.
pub struct EpochBatches {
    rx: Receiver<Result<HostBatch>>,
    remaining: usize,
    _worker: JoinHandle<()>,
}

impl EpochBatches {
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl Iterator for EpochBatches {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(batch)) => {
                self.remaining -= 1;
                Some(Ok(batch))
            }
            Ok(Err(e)) => {
                self.remaining = 0;
                Some(Err(e))
            }
            Err(_) => {
                self.remaining = 0;
                Some(Err(Error::Dataset("batch loader stopped early".into())))
            }
        }
    }
}
