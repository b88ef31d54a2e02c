//! Transcript list files.
//!
//! Two layouts are accepted:
//!
//! ```text
//! speaker_A.list   filepath|speaker|lang|text      (one entry per line)
//! data.json        [{"filepath": .., "speaker": .., "lang": .., "text": ..}, ...]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub filepath: String,
    pub speaker: String,
    pub lang: String,
    pub text: String,
}

/// Read a `.list` or `.json` file, chosen by extension.
pub fn read_list(path: impl AsRef<Path>) -> Result<Vec<ListEntry>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    let entries = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw)?,
        Some("list") => parse_list(&raw)?,
        _ => {
            return Err(Error::Dataset(format!(
                "{}: expected a .list or .json file",
                path.display()
            )));
        }
    };
    tracing::debug!("{}: {} entries", path.display(), entries.len());
    Ok(entries)
}

/// Parse `filepath|speaker|lang|text` lines. Blank lines are skipped; the
/// transcript keeps any further `|` characters.
pub fn parse_list(raw: &str) -> Result<Vec<ListEntry>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let mut fields = line.trim_end_matches('\r').splitn(4, '|');
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(filepath), Some(speaker), Some(lang), Some(text)) => Ok(ListEntry {
                    filepath: filepath.trim().to_string(),
                    speaker: speaker.trim().to_string(),
                    lang: lang.trim().to_string(),
                    text: text.trim().to_string(),
                }),
                _ => Err(Error::Dataset(format!(
                    "line {}: expected filepath|speaker|lang|text",
                    i + 1
                ))),
            }
        })
        .collect()
}
