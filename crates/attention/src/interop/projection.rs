//! Adapter giving the engine a uniform view of its projections.

use std::sync::Arc;

use candle_core::Tensor;
use mha_layers::{LinearLayer, PrecisionPolicy};

use crate::core::{AttentionError, Result};

/// A projection capability plus the precision it runs under.
#[derive(Clone)]
pub struct Projection {
    layer: Arc<dyn LinearLayer>,
    policy: PrecisionPolicy,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection")
            .field("config", self.layer.config())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Projection {
    pub fn new(layer: Arc<dyn LinearLayer>, policy: PrecisionPolicy) -> Self {
        Self { layer, policy }
    }

    pub fn input_dim(&self) -> usize {
        self.layer.config().input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.layer.config().output_dim
    }

    pub fn policy(&self) -> PrecisionPolicy {
        self.policy
    }

    /// Applies the projection to `[batch, seq, input_dim]`.
    pub fn transform(&self, x: &Tensor) -> Result<Tensor> {
        let width = x.dims().last().copied().unwrap_or(0);
        if width != self.input_dim() {
            return Err(AttentionError::shape(format!(
                "projection expects last dim {} but received {:?}",
                self.input_dim(),
                x.dims()
            )));
        }
        Ok(self.layer.forward(x, &self.policy)?)
    }
}
