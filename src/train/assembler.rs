//! Combined text/audio sequence construction.
//!
//! ```text
//! text ids   [B, T]        ── repeat over num_vq ──┐
//! audio ids  [B, A, V]     ── pad → 0, + end marker ┴─► input_ids [B, T+A+1, V]
//!
//! row with 2 valid of A = 4 audio steps:
//!   audio mask   1 1 0 0 │ 0
//!   ext mask     1 1 1 0 │ 0     marker at index valid_len = 2
//!   ext ids      a a E P │ P     E = end marker, P = pad (both id 0)
//! ```
//!
//! The end marker goes at each row's own valid length. It is placed with an
//! index comparison against the per-row mask sum, so there is no per-row loop
//! and a row without audio gets its marker at audio index 0.

use candle_core::{DType, Result, Tensor};

/// Audio end-of-sequence id.
pub const AUDIO_EOS_ID: u32 = 0;
/// Audio padding id; equal to the end marker.
pub const AUDIO_PAD_ID: u32 = AUDIO_EOS_ID;
/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Model inputs and targets for one batch.
#[derive(Debug, Clone)]
pub struct AssembledSequence {
    /// `[B, T + A + 1, V]` (U32)
    pub input_ids: Tensor,
    /// `[B, T + A + 1]` (U8)
    pub attention_mask: Tensor,
    /// `[B, T + A + 1]` (U8), 1 on the text segment
    pub text_mask: Tensor,
    /// `[B, T + A + 1, V]` (I64), [`IGNORE_INDEX`] outside `attention_mask`
    pub labels: Tensor,
    pub text_len: usize,
    pub audio_len: usize,
}

impl AssembledSequence {
    pub fn seq_len(&self) -> usize {
        self.text_len + self.audio_len + 1
    }
}

/// Build the combined sequence.
///
/// - `text_ids`, `text_mask`: `[B, T]`
/// - `audio_ids`: `[B, A, V]` quantized ids (U32)
/// - `audio_mask`: `[B, A]`, a left-aligned valid prefix per row
pub fn assemble(
    text_ids: &Tensor,
    text_mask: &Tensor,
    audio_ids: &Tensor,
    audio_mask: &Tensor,
) -> Result<AssembledSequence> {
    let (b, text_len) = text_ids.dims2()?;
    let (ab, audio_len, num_vq) = audio_ids.dims3()?;
    if ab != b || audio_mask.dims2()? != (b, audio_len) || text_mask.dims2()? != (b, text_len) {
        candle_core::bail!(
            "batch shapes disagree: text {:?}/{:?}, audio {:?}/{:?}",
            text_ids.dims(),
            text_mask.dims(),
            audio_ids.dims(),
            audio_mask.dims()
        );
    }
    let device = text_ids.device();
    let text_ids = text_ids.to_dtype(DType::U32)?;
    let text_mask = text_mask.to_dtype(DType::U8)?;
    let audio_ids = audio_ids.to_dtype(DType::U32)?;
    let audio_mask = audio_mask.to_dtype(DType::U8)?;
    let ext_len = audio_len + 1;

    // Padding positions carry the pad id.
    let pad_ids = Tensor::full(AUDIO_PAD_ID, (b, audio_len, num_vq), device)?;
    let valid = audio_mask.unsqueeze(2)?.broadcast_as((b, audio_len, num_vq))?.contiguous()?;
    let audio_ids = valid.where_cond(&audio_ids, &pad_ids)?;

    // marker[b, j] = (j == valid_len[b])
    let valid_len = audio_mask.to_dtype(DType::U32)?.sum_keepdim(1)?;
    let positions = Tensor::arange(0u32, ext_len as u32, device)?.unsqueeze(0)?;
    let marker = positions.broadcast_eq(&valid_len)?;

    let ext_mask = Tensor::cat(&[&audio_mask, &Tensor::zeros((b, 1), DType::U8, device)?], 1)?
        .maximum(&marker)?;
    let ext_ids = Tensor::cat(
        &[&audio_ids, &Tensor::full(AUDIO_PAD_ID, (b, 1, num_vq), device)?],
        1,
    )?;
    let marker_slots = marker.unsqueeze(2)?.broadcast_as((b, ext_len, num_vq))?.contiguous()?;
    let eos = Tensor::full(AUDIO_EOS_ID, (b, ext_len, num_vq), device)?;
    let ext_ids = marker_slots.where_cond(&eos, &ext_ids)?;

    let text_slots = text_ids
        .unsqueeze(2)?
        .broadcast_as((b, text_len, num_vq))?
        .contiguous()?;
    let input_ids = Tensor::cat(&[&text_slots, &ext_ids], 1)?;
    let attention_mask = Tensor::cat(&[&text_mask, &ext_mask], 1)?;
    let segment = Tensor::cat(
        &[
            &Tensor::ones((b, text_len), DType::U8, device)?,
            &Tensor::zeros((b, ext_len), DType::U8, device)?,
        ],
        1,
    )?;

    let seq_len = text_len + ext_len;
    let keep = attention_mask
        .unsqueeze(2)?
        .broadcast_as((b, seq_len, num_vq))?
        .contiguous()?;
    let ignore = Tensor::full(IGNORE_INDEX, (b, seq_len, num_vq), device)?;
    let labels = keep.where_cond(&input_ids.to_dtype(DType::I64)?, &ignore)?;

    Ok(AssembledSequence {
        input_ids,
        attention_mask,
        text_mask: segment,
        labels,
        text_len,
        audio_len,
    })
}
