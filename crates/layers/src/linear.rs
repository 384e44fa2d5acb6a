//! Affine projections used for the query/key/value/output roles.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows, in_dim)`)
//! and return `(batch, seq, out_dim)`. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is returned in
//! [`PrecisionPolicy::storage`].

use candle_core::{DType, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Static geometry of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Outgoing feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector is added after the matmul.
    pub bias: bool,
}

impl LinearConfig {
    /// Projection with a bias, matching the attention projections.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Capability shared by every projection variant (single or routed).
pub trait LinearLayer: Send + Sync {
    /// Geometry used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Dense affine projection `x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Wraps pre-existing parameters. `weight` is `(output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", &weight, &checks::FLOAT_DTYPES)?;
        checks::expect_contiguous("linear.weight", &weight)?;

        match (config.bias, bias.as_ref()) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &checks::FLOAT_DTYPES)?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }

        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Identity weight with zero bias; handy for probing downstream layers.
    pub fn identity(dim: usize, dtype: DType, device: &candle_core::Device) -> Result<Self> {
        let data: Vec<f32> = (0..dim * dim)
            .map(|idx| if idx / dim == idx % dim { 1.0 } else { 0.0 })
            .collect();
        let weight = Tensor::from_vec(data, (dim, dim), device)?.to_dtype(dtype)?;
        let bias = Tensor::zeros(dim, dtype, device)?;
        Self::new(LinearConfig::new(dim, dim), weight, Some(bias))
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, width] => {
                if *width != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "linear.input: expected last dim {} but received {}",
                        self.config.input_dim, width
                    )))
                } else if *batch == 0 || *seq == 0 {
                    Err(Error::Msg(
                        "linear.input: batch/seq dimensions must be non-zero".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            [_, width] if *width == self.config.input_dim => Ok(()),
            dims => Err(Error::Msg(format!(
                "linear.input: expected [B, T, {0}] or [T, {0}], got {dims:?}",
                self.config.input_dim
            ))),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;

        let mut output = match *input.dims() {
            [batch, seq, _] => input
                .reshape((batch * seq, self.config.input_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, self.config.output_dim))?,
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output)
    }
}
