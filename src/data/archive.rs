//! Tar archive holding the training audio.
//!
//! The archive is indexed once (member path → byte range). Members are then
//! read either from an in-memory copy or by seeking in the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Span {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

#[derive(Debug)]
pub struct TarArchive {
    index: HashMap<String, Span>,
    storage: Storage,
}

/// Archive member key: forward slashes, no leading `./` or `/`.
pub fn normalize_member(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut rest = path.as_str();
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
        } else {
            break;
        }
    }
    rest.to_string()
}

impl TarArchive {
    pub fn open(path: impl AsRef<Path>, in_memory: bool) -> Result<Self> {
        let path = path.as_ref();
        let index = build_index(File::open(path)?)?;
        let storage = if in_memory {
            Storage::Memory(std::fs::read(path)?)
        } else {
            Storage::Disk(path.to_path_buf())
        };
        tracing::info!(
            "{}: indexed {} members ({})",
            path.display(),
            index.len(),
            if in_memory { "in memory" } else { "on disk" }
        );
        Ok(Self { index, storage })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.index.contains_key(&normalize_member(member))
    }

    /// Bytes of one regular-file member.
    pub fn read(&self, member: &str) -> Result<Vec<u8>> {
        let key = normalize_member(member);
        let span = *self
            .index
            .get(&key)
            .ok_or_else(|| Error::Dataset(format!("{key} not found in tar archive")))?;
        let size = usize::try_from(span.size)
            .map_err(|_| Error::Dataset(format!("{key} is too large")))?;
        match &self.storage {
            Storage::Memory(bytes) => {
                let start = span.offset as usize;
                bytes
                    .get(start..start + size)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::Dataset(format!("{key} lies outside the archive")))
            }
            Storage::Disk(path) => {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(span.offset))?;
                let mut buf = vec![0u8; size];
                file.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

fn build_index(file: File) -> Result<HashMap<String, Span>> {
    let mut archive = tar::Archive::new(file);
    let mut index = HashMap::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = normalize_member(&entry.path()?.to_string_lossy());
        index.insert(
            name,
            Span {
                offset: entry.raw_file_position(),
                size: entry.size(),
            },
        );
    }
    Ok(index)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a tar with the given `(member, bytes)` pairs.
    pub(crate) fn write_tar(path: &Path, members: &[(&str, &[u8])]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, bytes) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *bytes).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn normalizes_members() {
        assert_eq!(normalize_member("./a/b.wav"), "a/b.wav");
        assert_eq!(normalize_member("/a\\b.wav"), "a/b.wav");
    }

    #[test]
    fn reads_members_in_both_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tar");
        write_tar(
            &path,
            &[
                ("Xz/a.wav", b"first member".as_slice()),
                ("Xz/b.wav", [7u8; 1500].as_slice()),
            ],
        );

        for in_memory in [true, false] {
            let archive = TarArchive::open(&path, in_memory).unwrap();
            assert_eq!(archive.len(), 2);
            assert!(archive.contains("./Xz/a.wav"));
            assert_eq!(archive.read("Xz/a.wav").unwrap(), b"first member");
            assert_eq!(archive.read("Xz/b.wav").unwrap(), vec![7u8; 1500]);
            assert!(archive.read("Xz/missing.wav").is_err());
        }
    }
}
