//! Layer building blocks consumed by the attention engine.
//!
//! Everything here follows the `(batch, seq, hidden)` convention and returns
//! `candle_core::Result` so callers can propagate failures with `?`.
//!
//! * [`linear`] hosts the single affine projection and the [`linear::LinearLayer`]
//!   capability shared by every projection variant.
//! * [`multiway`] routes each token to one of several expert projections.
//! * [`norm`] provides LayerNorm with a portable and a fused implementation.
//! * [`dtypes`] centralises the storage/compute/reduction precision policy.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod multiway;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearLayer};
pub use multiway::{Multiway, SplitPositionRouter, TokenRouter};
pub use norm::{FusedLayerNorm, LayerNorm, NormBackend, NormConfig, NormalizationLayer};
