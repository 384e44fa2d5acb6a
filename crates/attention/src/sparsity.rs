//! Magnitude pruning of projected vectors.

use candle_core::{DType, Tensor, D};

use crate::core::{AttentionError, Result};

/// Keeps the `max(1, ceil(ratio * d))` largest-magnitude entries of every
/// last-axis vector and zeroes the rest. Ties keep the earlier entry in sort
/// order. `ratio == 1` returns the input unchanged.
pub fn prune(x: &Tensor, ratio: f32) -> Result<Tensor> {
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(AttentionError::config(format!(
            "sparsity ratio must be in (0, 1], got {ratio}"
        )));
    }
    if ratio == 1.0 {
        return Ok(x.clone());
    }
    let width = x.dim(D::Minus1)?;
    if width == 0 {
        return Ok(x.clone());
    }
    // `ratio` carries f32 representation error (0.1f32 > 0.1); drop it before
    // the ceiling so `0.1 * 10` keeps one entry, not two.
    let scaled = ratio as f64 * width as f64;
    let keep = ((scaled - scaled * f32::EPSILON as f64).ceil() as usize).clamp(1, width);

    let magnitude = x.abs()?.to_dtype(DType::F32)?.contiguous()?;
    let order = magnitude.arg_sort_last_dim(false)?;
    let rank = order.to_dtype(DType::F32)?.arg_sort_last_dim(true)?;
    let kept = rank.lt(keep as u32)?;
    Ok(kept.where_cond(x, &x.zeros_like()?)?)
}
