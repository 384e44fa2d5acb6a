//! Key/value state carried across incremental decoding steps.
//!
//! The engine reads the state at the start of a call, concatenates the new
//! projections along the sequence axis and writes the result back. The state
//! is owned by the caller; the engine never retains it between calls.

pub mod incremental;

pub use incremental::IncrementalState;

#[cfg(test)]
mod tests;
