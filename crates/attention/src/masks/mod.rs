//! Mask utilities shared by attention implementations.
//!
//! Additive masks have dtype `f32` with entries `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard). Key padding masks are `u8` tensors shaped
//! `[batch, k_len]` where a non-zero entry marks a padded key.

pub mod causal;
pub mod padding;

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Result};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Dtype of key padding masks.
pub const PADDING_DTYPE: DType = DType::U8;

pub use causal::build_causal_mask;
pub use padding::{key_padding_mask_from_booleans, key_padding_mask_from_lengths};

/// Brings an additive mask to rank 4 (`[batch|1, heads|1, q_len, k_len]`)
/// in [`MASK_DTYPE`].
pub(crate) fn normalize_attn_mask(
    mask: &Tensor,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    if !mask.dtype().is_float() {
        return Err(AttentionError::dtype(format!(
            "attn_mask must be a float tensor, got {:?}",
            mask.dtype()
        )));
    }
    let mask = match *mask.dims() {
        [mq, mk] if mq == q_len && mk == k_len => mask.reshape((1, 1, q_len, k_len))?,
        [mb, mq, mk] if (mb == batch || mb == 1) && mq == q_len && mk == k_len => {
            mask.unsqueeze(1)?
        }
        [mb, mh, mq, mk]
            if (mb == batch || mb == 1)
                && (mh == heads || mh == 1)
                && mq == q_len
                && mk == k_len =>
        {
            mask.clone()
        }
        ref dims => {
            return Err(AttentionError::shape(format!(
                "attn_mask {dims:?} is not broadcastable to [{batch}, {heads}, {q_len}, {k_len}]"
            )))
        }
    };
    Ok(mask.to_dtype(MASK_DTYPE)?)
}

/// Validates a key padding mask and returns it as a `[batch, 1, 1, k_len]`
/// `u8` tensor holding `1` for padded keys.
pub(crate) fn normalize_key_padding(mask: &Tensor, batch: usize, k_len: usize) -> Result<Tensor> {
    if mask.dims() != [batch, k_len] {
        return Err(AttentionError::shape(format!(
            "key_padding_mask must be [{batch}, {k_len}], got {:?}",
            mask.dims()
        )));
    }
    let flags = match mask.dtype() {
        PADDING_DTYPE => mask.clone(),
        DType::U32 | DType::I64 => mask.ne(0u32)?,
        other => {
            return Err(AttentionError::dtype(format!(
                "key_padding_mask must be an integer tensor, got {other:?}"
            )))
        }
    };
    Ok(flags.reshape((batch, 1, 1, k_len))?)
}
