//! Error types emitted by the attention engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttentionError>;

/// Attention-specific error category.
#[derive(Error, Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The configuration cannot describe a valid attention layer.
    #[error("invalid configuration: {context}")]
    InvalidConfig { context: String },
    /// The selected backend cannot serve this combination of inputs.
    #[error("unsupported configuration: {context}")]
    UnsupportedConfiguration { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    /// Caller mistakes detected before any tensor computation.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::InvalidShape { .. } | Self::InvalidConfig { .. })
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::InvalidConfig {
            context: context.into(),
        }
    }

    pub(crate) fn unsupported(context: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration {
            context: context.into(),
        }
    }

    pub(crate) fn dtype(requested: impl Into<String>) -> Self {
        Self::UnsupportedDType {
            requested: requested.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
