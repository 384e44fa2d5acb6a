//! Configuration options for the multi-head attention engine.
//!
//! The [`Config`] struct captures the geometry and run-time knobs (dropout,
//! backend, precision, sparsity) that callers can tune without swapping
//! implementations. It is serde-serialisable with defaults for every field, so
//! callers may load it from whatever format they use.

use std::env;

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

pub use mha_layers::NormBackend;

/// Which score computation serves a forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    /// Explicit score matrix; supports every input combination.
    #[default]
    Reference,
    /// Tiled kernel that never materialises the score matrix.
    Fused,
}

/// Dtype used for the attention matmuls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionPolicy {
    /// Compute in the dtype of the projected inputs; `f16`/`bf16` matmuls
    /// are promoted to `f32` as in the projections.
    #[default]
    Inherit,
    /// Promote q/k/v to `f32` and cast the result back.
    #[serde(rename = "f32")]
    ForceF32,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model width; split evenly across heads.
    pub embed_dim: usize,
    pub num_heads: usize,
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Queries, keys and values come from the same sequence.
    pub self_attention: bool,
    /// Keys and values come from an encoder memory.
    pub encoder_decoder_attention: bool,
    /// Mask keys that lie in the future of each query.
    pub causal: bool,
    /// LayerNorm over the merged heads before the output projection.
    pub subln: bool,
    pub layernorm_eps: f64,
    /// Rotary position encoding with exponential decay on q/k.
    pub xpos_rel_pos: bool,
    pub xpos_scale_base: f32,
    pub backend: BackendSelection,
    /// Fraction of each projected vector kept by magnitude pruning.
    pub sparsity: Option<f32>,
    pub precision: PrecisionPolicy,
    pub norm_backend: NormBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embed_dim: 512,
            num_heads: 8,
            dropout_p: None,
            self_attention: true,
            encoder_decoder_attention: false,
            causal: false,
            subln: false,
            layernorm_eps: 1e-5,
            xpos_rel_pos: false,
            xpos_scale_base: 512.0,
            backend: BackendSelection::Reference,
            sparsity: None,
            precision: PrecisionPolicy::Inherit,
            norm_backend: NormBackend::Portable,
        }
    }
}

impl Config {
    /// Self-attention layer of the given geometry with default knobs.
    pub fn self_attention(embed_dim: usize, num_heads: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            ..Self::default()
        }
    }

    /// Encoder-decoder (cross) attention layer of the given geometry.
    pub fn encoder_decoder(embed_dim: usize, num_heads: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            self_attention: false,
            encoder_decoder_attention: true,
            ..Self::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        if self.num_heads == 0 {
            0
        } else {
            self.embed_dim / self.num_heads
        }
    }

    /// Dropout probability that applies during training, if any.
    pub fn active_dropout(&self) -> Option<f32> {
        self.dropout_p.filter(|p| *p > 0.0)
    }

    /// Checks every invariant the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.self_attention == self.encoder_decoder_attention {
            return Err(AttentionError::config(
                "exactly one of self_attention and encoder_decoder_attention must be set",
            ));
        }
        if self.embed_dim == 0 || self.num_heads == 0 {
            return Err(AttentionError::config(format!(
                "embed_dim ({}) and num_heads ({}) must be positive",
                self.embed_dim, self.num_heads
            )));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(AttentionError::config(format!(
                "embed_dim {} is not divisible by num_heads {}",
                self.embed_dim, self.num_heads
            )));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(AttentionError::config(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
        }
        if let Some(ratio) = self.sparsity {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(AttentionError::config(format!(
                    "sparsity ratio must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.subln && !(self.layernorm_eps > 0.0) {
            return Err(AttentionError::config(format!(
                "layernorm_eps must be positive, got {}",
                self.layernorm_eps
            )));
        }
        if self.xpos_rel_pos {
            if !(self.xpos_scale_base > 0.0) {
                return Err(AttentionError::config(format!(
                    "xpos_scale_base must be positive, got {}",
                    self.xpos_scale_base
                )));
            }
            if self.head_dim() % 2 != 0 {
                return Err(AttentionError::config(format!(
                    "xpos requires an even head_dim, got {}",
                    self.head_dim()
                )));
            }
        }
        Ok(())
    }

    /// Applies `MHA_BACKEND`, `MHA_PRECISION` and `MHA_SPARSITY` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup. Unparsable values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MHA_BACKEND") {
            match value.trim().to_ascii_lowercase().as_str() {
                "reference" => self.backend = BackendSelection::Reference,
                "fused" => self.backend = BackendSelection::Fused,
                other => log::warn!("ignoring MHA_BACKEND={other}: expected reference|fused"),
            }
        }
        if let Some(value) = lookup("MHA_PRECISION") {
            match value.trim().to_ascii_lowercase().as_str() {
                "inherit" => self.precision = PrecisionPolicy::Inherit,
                "f32" | "force_f32" => self.precision = PrecisionPolicy::ForceF32,
                other => log::warn!("ignoring MHA_PRECISION={other}: expected inherit|f32"),
            }
        }
        if let Some(value) = lookup("MHA_SPARSITY") {
            let value = value.trim().to_ascii_lowercase();
            if value == "off" || value == "none" {
                self.sparsity = None;
            } else {
                match value.parse::<f32>() {
                    Ok(ratio) if ratio > 0.0 && ratio <= 1.0 => self.sparsity = Some(ratio),
                    _ => log::warn!("ignoring MHA_SPARSITY={value}: expected off or a ratio in (0, 1]"),
                }
            }
        }
    }
}
