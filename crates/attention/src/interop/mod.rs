//! Interoperability helpers bridging attention with upstream components.

pub mod position;
pub mod projection;
pub mod types;

pub use position::PositionEncoder;
pub use projection::Projection;
pub use types::AttentionShape;
