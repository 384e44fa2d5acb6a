//! Portable, exact implementation of the attention score computation.
//!
//! This path favours clarity over absolute performance, supports every input
//! combination and serves as the baseline for validating the fused kernel.

pub mod exact;

pub use exact::ExactAttention;
