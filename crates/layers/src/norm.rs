//! LayerNorm applied to attention outputs before the output projection.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised
//! along the last axis. Two interchangeable implementations exist:
//!
//! * [`LayerNorm`] computes mean and variance explicitly in
//!   [`PrecisionPolicy::reduction`]; it runs anywhere candle runs.
//! * [`FusedLayerNorm`] delegates to `candle_nn::ops::layer_norm`, which maps to
//!   a single kernel on backends that provide one.
//!
//! The choice is made once, when the layer is built, through [`NormBackend`].

use std::sync::Arc;

use candle_core::{DType, Device, Error, Result, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy};

/// Which LayerNorm implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormBackend {
    /// Explicit mean/variance reductions.
    #[default]
    Portable,
    /// Single-kernel `candle_nn::ops::layer_norm`.
    Fused,
}

/// Configuration shared by both LayerNorm implementations.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// Capability implemented by every normalisation layer.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

fn validate_affine(config: &NormConfig, weight: &Tensor, bias: &Tensor) -> Result<()> {
    checks::expect_shape("norm.weight", weight, &[config.hidden_size])?;
    checks::expect_shape("norm.bias", bias, &[config.hidden_size])?;
    checks::expect_dtype_in("norm.weight", weight, &checks::FLOAT_DTYPES)?;
    checks::expect_dtype_in("norm.bias", bias, &checks::FLOAT_DTYPES)?;
    if config.epsilon <= 0.0 {
        return Err(Error::Msg(format!(
            "norm epsilon must be positive, got {}",
            config.epsilon
        )));
    }
    Ok(())
}

/// Portable LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        validate_affine(&config, &weight, &bias)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}

/// LayerNorm backed by `candle_nn::ops::layer_norm`.
#[derive(Debug, Clone)]
pub struct FusedLayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl FusedLayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        validate_affine(&config, &weight, &bias)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }
}

impl NormalizationLayer for FusedLayerNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?.contiguous()?;
        let weight = self.weight.to_dtype(compute.dtype())?;
        let bias = self.bias.to_dtype(compute.dtype())?;
        let output =
            candle_nn::ops::layer_norm(&compute, &weight, &bias, self.config.epsilon as f32)?;
        policy.cast_to_storage(&output)
    }
}

/// Builds a LayerNorm initialised to the identity affine transform
/// (scale 1, bias 0) using the requested implementation.
pub fn build_layer_norm(
    backend: NormBackend,
    config: NormConfig,
    dtype: DType,
    device: &Device,
) -> Result<Arc<dyn NormalizationLayer>> {
    let weight = Tensor::ones(config.hidden_size, dtype, device)?;
    let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
    Ok(match backend {
        NormBackend::Portable => Arc::new(LayerNorm::new(weight, bias, config)?),
        NormBackend::Fused => Arc::new(FusedLayerNorm::new(weight, bias, config)?),
    })
}
