//! Relative position encoders applied to per-head query/key views.

use candle_core::Tensor;
use mha_embedding::XPos;

use crate::core::Result;

/// Injects position information into `[batch * heads, seq, head_dim]` views.
///
/// `offset` places the first row at that position within a longer window;
/// `downscale` selects the key-side variant of the encoding.
pub trait PositionEncoder: Send + Sync {
    fn encode(&self, x: &Tensor, offset: usize, downscale: bool) -> Result<Tensor>;
}

impl PositionEncoder for XPos {
    fn encode(&self, x: &Tensor, offset: usize, downscale: bool) -> Result<Tensor> {
        Ok(self.apply(x, offset, downscale)?)
    }
}
