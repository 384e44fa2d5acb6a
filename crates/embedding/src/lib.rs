//! Relative position encoders for attention heads.
//!
//! The positional module exposes [`positional::xpos::XPos`], a rotary
//! embedding with per-frequency exponential decay that keeps query/key dot
//! products a function of relative distance.

pub mod positional;

pub use positional::xpos::XPos;
