//! Training data: list files, audio archives, preprocessing and batching.
//!
//! ```text
//! .list/.json ─► AudioDataset (wav → mel, prompt → ids) ─► Loader (shuffle, collate) ─► Batch
//!                    ▲
//!          directory or TarArchive
//! ```

pub mod archive;
pub mod collator;
pub mod dataset;
pub mod list;
pub mod loader;

pub use archive::TarArchive;
pub use collator::{Batch, HostBatch, collate};
pub use dataset::{AudioDataset, AudioSource, DatasetOptions, Sample};
pub use list::{ListEntry, read_list};
pub use loader::{EpochBatches, Loader};
