//! Builders for key padding masks.
//!
//! Masks are [`PADDING_DTYPE`](super::PADDING_DTYPE) tensors shaped
//! `[batch, k_len]`; `1` marks a padded key that no query may attend to.

use candle_core::{Device, Error, Result, Tensor};

/// Construct padding masks from per-batch valid key lengths.
///
/// Lengths larger than `k_len` are clamped, so such rows mask nothing.
pub fn key_padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let data: Vec<u8> = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| u8::from(k >= valid)))
        .collect();
    Tensor::from_vec(data, (key_lengths.len(), k_len), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn key_padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(row) = padding.iter().position(|mask| mask.len() != k_len) {
        return Err(Error::Msg(format!(
            "padding row {row} has {} entries, expected {k_len}",
            padding[row].len()
        )));
    }
    let data: Vec<u8> = padding
        .iter()
        .flat_map(|mask| mask.iter().map(|&is_padding| u8::from(is_padding)))
        .collect();
    Tensor::from_vec(data, (padding.len(), k_len), device)
}
