//! Multi-head scaled dot-product attention.
//!
//! The crate serves encoder-style (full context) and decoder-style
//! (autoregressive, cached) attention through [`MultiheadAttention`]. Inputs
//! are `[batch, seq_len, embed_dim]` tensors in `bf16`, `f16`, `f32` or `f64`;
//! softmax reductions run in `f32` and outputs match the input dtype.
//!
//! Two score backends are available, selected by [`core::BackendSelection`]:
//! the reference path in [`reference`] materialises the score matrix and
//! supports every optional input, while the fused path in [`fused`] tiles the
//! computation and returns no attention weights. Both agree on their shared
//! configuration subset.
//!
//! Dropout is an optional, train-only concern controlled via the public
//! configuration and the per-call `training` flag. Callers should disable it
//! for evaluation or when deterministic outputs are required.
//!
//! Masks are additive `f32` tensors (`0.0` keep, `-inf` discard) plus an
//! optional `u8` key padding mask; see [`masks`] for builders. A query row
//! whose keys are all masked receives zero weights.

pub mod core;
pub mod fused;
pub mod interop;
pub mod kv_cache;
pub mod masks;
pub mod multihead;
pub mod reference;
pub mod sparsity;

pub use core::{Attention, AttentionError, BackendSelection, Config, PrecisionPolicy};
pub use kv_cache::IncrementalState;
pub use multihead::{AttentionInputs, AttentionOutput, MultiheadAttention, Projections};
pub use sparsity::prune;
