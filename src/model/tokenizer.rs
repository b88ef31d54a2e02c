//! Transcript tokenizer.
//!
//! Wraps the ChatTTS `tokenizer.json`. Training prompts use the layout the
//! GPT was pretrained on:
//!
//! ```text
//! [Stts][spk_emb]{transcript}[Ptts]
//! ```
//!
//! `[spk_emb]` marks the position whose embedding is replaced by the speaker
//! vector.

use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::TokenizerError;
use crate::{Error, Result};

pub const SPK_EMB_TOKEN: &str = "[spk_emb]";
pub const PAD_TOKEN: &str = "[PAD]";

pub fn training_prompt(text: &str) -> String {
    format!("[Stts]{SPK_EMB_TOKEN}{text}[Ptts]")
}

#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    spk_emb_id: u32,
}

impl TextTokenizer {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            Error::Tokenizer(TokenizerError(format!("{}: {e}", path.display())))
        })?;
        Self::new(inner)
    }

    pub fn new(inner: Tokenizer) -> Result<Self> {
        let spk_emb_id = inner.token_to_id(SPK_EMB_TOKEN).ok_or_else(|| {
            Error::Tokenizer(TokenizerError(format!("vocabulary has no {SPK_EMB_TOKEN}")))
        })?;
        let pad_id = match inner.token_to_id(PAD_TOKEN) {
            Some(id) => id,
            None => {
                tracing::warn!("vocabulary has no {PAD_TOKEN}, padding text with id 0");
                0
            }
        };
        Ok(Self {
            inner,
            pad_id,
            spk_emb_id,
        })
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn spk_emb_id(&self) -> u32 {
        self.spk_emb_id
    }

    /// Token ids without post-processor special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Ids of the wrapped training prompt for `text`.
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        self.encode(&training_prompt(text))
    }
}
