//! Shape bookkeeping for the per-head views.

use candle_core::Tensor;

use crate::core::Result;

/// Logical description of attention tensor shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Batch size for the attention invocation.
    pub batch: usize,
    /// Number of heads processed in parallel.
    pub num_heads: usize,
    /// Dimensionality per-head.
    pub head_dim: usize,
}

impl AttentionShape {
    pub fn embed_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// `[batch, seq, embed]` -> `[batch * heads, seq, head_dim]`.
    pub fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq, _) = x.dims3()?;
        Ok(x
            .reshape((self.batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((self.batch * self.num_heads, seq, self.head_dim))?)
    }

    /// `[batch * heads, seq, head_dim]` -> `[batch, heads, seq, head_dim]`.
    pub fn to_cache_layout(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq, _) = x.dims3()?;
        Ok(x.reshape((self.batch, self.num_heads, seq, self.head_dim))?)
    }

    /// `[batch, heads, seq, head_dim]` -> `[batch * heads, seq, head_dim]`.
    pub fn from_cache_layout(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, seq, _) = x.dims4()?;
        Ok(x.reshape((self.batch * self.num_heads, seq, self.head_dim))?)
    }

    /// `[batch * heads, seq, head_dim]` -> `[batch, seq, embed]`.
    pub fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq, _) = x.dims3()?;
        Ok(x
            .reshape((self.batch, self.num_heads, seq, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((self.batch, seq, self.embed_dim()))?)
    }
}
