//! Fused attention kernels.
//!
//! A fused kernel consumes queries, keys and values packed into a single
//! `[batch, seq, 3, heads, head_dim]` tensor and never materialises the full
//! score matrix. It therefore cannot report attention weights, and it serves a
//! narrower set of inputs than the reference path: no additive mask, no
//! relative bias, no incremental state and equal query/key lengths.

pub mod cpu;

use candle_core::Tensor;

use crate::core::Result;

pub use cpu::CpuFlashKernel;

/// Per-call knobs understood by every fused kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedParams {
    pub causal: bool,
    /// Dropout applied to the attention probabilities; zero disables it.
    pub dropout_p: f32,
    /// Multiplier applied to `q · k` before the softmax.
    pub softmax_scale: f32,
}

/// Result of a fused kernel call.
#[derive(Debug, Clone)]
pub struct FusedOutput {
    /// `[batch, seq, heads, head_dim]` in the dtype of the packed input.
    pub attn: Tensor,
    /// Kernels that never build the score matrix return `None`.
    pub weights: Option<Tensor>,
}

/// Low-memory attention over packed projections.
pub trait FusedKernel: Send + Sync {
    /// `key_padding_mask` is `[batch, seq]`; non-zero entries mark keys that
    /// no query may attend to.
    fn compute(
        &self,
        packed_qkv: &Tensor,
        key_padding_mask: Option<&Tensor>,
        params: &FusedParams,
    ) -> Result<FusedOutput>;
}

/// Packs per-head views `[batch * heads, seq, head_dim]` into
/// `[batch, seq, 3, heads, head_dim]`.
pub fn pack_qkv(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    batch: usize,
    heads: usize,
) -> Result<Tensor> {
    let to_seq_major = |x: &Tensor| -> Result<Tensor> {
        let (_, seq, head_dim) = x.dims3()?;
        Ok(x.reshape((batch, heads, seq, head_dim))?.transpose(1, 2)?)
    };
    let packed = Tensor::stack(&[to_seq_major(q)?, to_seq_major(k)?, to_seq_major(v)?], 2)?;
    Ok(packed.contiguous()?)
}
