//! Routed multi-expert projections.
//!
//! A [`Multiway`] layer owns several projections with identical geometry and
//! sends every token through exactly one of them. The choice is made by an
//! injected [`TokenRouter`], so the layer itself never decides which modality
//! or segment a token belongs to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Error, Result, Tensor};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearLayer},
};

/// Selects an expert per token.
pub trait TokenRouter: Send + Sync {
    /// Returns a `(batch, seq)` `u32` tensor of expert indices for `hidden`.
    fn route(&self, hidden: &Tensor) -> Result<Tensor>;
}

/// Two-expert router splitting the sequence at a caller-controlled position.
///
/// Tokens with a sequence index below the split use expert 0, the remainder
/// use expert 1. The default split (`usize::MAX`) sends everything to expert 0.
#[derive(Debug)]
pub struct SplitPositionRouter {
    split: AtomicUsize,
}

impl SplitPositionRouter {
    pub fn new() -> Self {
        Self {
            split: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn with_split(position: usize) -> Self {
        Self {
            split: AtomicUsize::new(position),
        }
    }

    /// Moves the split; takes effect on the next `route` call.
    pub fn set_split_position(&self, position: usize) {
        self.split.store(position, Ordering::Relaxed);
    }

    pub fn split_position(&self) -> usize {
        self.split.load(Ordering::Relaxed)
    }
}

impl Default for SplitPositionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRouter for SplitPositionRouter {
    fn route(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match hidden.dims() {
            [batch, seq, _] => (*batch, *seq),
            dims => {
                return Err(Error::Msg(format!(
                    "split router expects (batch, seq, hidden), got {dims:?}"
                )))
            }
        };
        let split = self.split_position();
        let row: Vec<u32> = (0..seq).map(|t| u32::from(t >= split)).collect();
        Tensor::from_vec(row, (1, seq), hidden.device())?.repeat((batch, 1))
    }
}

/// Projection that dispatches each token to one of several experts.
#[derive(Clone)]
pub struct Multiway {
    experts: Vec<Linear>,
    router: Arc<dyn TokenRouter>,
}

impl std::fmt::Debug for Multiway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiway")
            .field("experts", &self.experts.len())
            .field("config", self.config())
            .finish()
    }
}

impl Multiway {
    /// All experts must share one [`LinearConfig`].
    pub fn new(experts: Vec<Linear>, router: Arc<dyn TokenRouter>) -> Result<Self> {
        let first = experts
            .first()
            .ok_or_else(|| Error::Msg("multiway requires at least one expert".into()))?;
        if experts.iter().any(|e| e.config() != first.config()) {
            return Err(Error::Msg(
                "multiway experts must share input/output geometry".into(),
            ));
        }
        Ok(Self { experts, router })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    fn expert_mask(routes: &Tensor, expert: usize, dtype: DType) -> Result<Tensor> {
        routes.eq(expert as u32)?.to_dtype(dtype)?.unsqueeze(2)
    }

    fn check_routes(&self, routes: &Tensor, hidden: &Tensor) -> Result<()> {
        let (batch, seq) = routes.dims2()?;
        if hidden.dims().get(..2) != Some(&[batch, seq][..]) {
            return Err(Error::Msg(format!(
                "router produced {:?} for hidden {:?}",
                routes.dims(),
                hidden.dims()
            )));
        }
        let max = routes.max_all()?.to_vec0::<u32>()? as usize;
        if max >= self.experts.len() {
            return Err(Error::Msg(format!(
                "router selected expert {max} but only {} exist",
                self.experts.len()
            )));
        }
        Ok(())
    }
}

impl LinearLayer for Multiway {
    fn config(&self) -> &LinearConfig {
        self.experts[0].config()
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if self.experts.len() == 1 {
            return self.experts[0].forward(hidden, policy);
        }
        let routes = self.router.route(hidden)?.to_dtype(DType::U32)?;
        self.check_routes(&routes, hidden)?;

        let mut blended: Option<Tensor> = None;
        for (idx, expert) in self.experts.iter().enumerate() {
            let projected = policy.cast_for_matmul(&expert.forward(hidden, policy)?)?;
            let mask = Self::expert_mask(&routes, idx, projected.dtype())?;
            let contribution = projected.broadcast_mul(&mask)?;
            blended = Some(match blended {
                Some(acc) => acc.add(&contribution)?,
                None => contribution,
            });
        }
        let blended = blended.ok_or_else(|| Error::Msg("multiway has no experts".into()))?;
        policy.cast_to_storage(&blended)
    }
}
