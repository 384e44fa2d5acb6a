//! Core traits and types shared across attention implementations.
//!
//! Score engines operate on per-head views laid out
//! `[batch * n_heads, seq_len, head_dim]`. The query is expected to be
//! pre-scaled by `head_dim^-0.5`; softmax reductions accumulate in `f32`
//! regardless of the incoming dtype (`bf16`, `f16`, `f32` or `f64`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{BackendSelection, Config, NormBackend, PrecisionPolicy};
pub use errors::{AttentionError, Result};

/// Masks consumed by a score engine. Every field is optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskSet<'a> {
    /// Additive float mask broadcastable to `[batch, heads, q_len, k_len]`.
    pub attn_mask: Option<&'a Tensor>,
    /// `[batch, k_len]`; non-zero marks a padded key.
    pub key_padding_mask: Option<&'a Tensor>,
    /// Hide keys in the future of each query.
    pub causal: bool,
}

/// Per-call knobs for a score engine.
#[derive(Debug, Clone, Copy)]
pub struct ScoreParams<'a> {
    pub batch: usize,
    pub num_heads: usize,
    /// Bias added to the normalised weights; element count must equal
    /// `batch * heads * q_len * k_len`.
    pub rel_pos: Option<&'a Tensor>,
    /// Dropout probability; `None` or zero disables it.
    pub dropout_p: Option<f32>,
    pub precision: PrecisionPolicy,
}

/// Result of a score engine call.
#[derive(Debug, Clone)]
pub struct ScoreOutput {
    /// `[batch * heads, q_len, head_dim]`.
    pub attn: Tensor,
    /// `[batch, heads, q_len, k_len]`, post-softmax and pre-dropout.
    pub weights: Tensor,
}

/// Unified interface for score engines.
///
/// * `q` is `[batch * heads, q_len, head_dim]`, `k`/`v` are
///   `[batch * heads, k_len, head_dim]`, all sharing dtype and device.
/// * The attention output mirrors the dtype of `q`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &MaskSet<'_>,
        params: &ScoreParams<'_>,
    ) -> Result<ScoreOutput>;
}
