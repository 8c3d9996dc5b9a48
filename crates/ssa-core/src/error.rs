//! Error type shared across the SSA workspace.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by SSA construction, training and evaluation.
///
/// Numerical trouble (NaN/Inf from a degenerate flow) is *not*
/// represented here: it propagates through the tensors to the caller.
#[derive(Debug, Error)]
pub enum SsaError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A named option (optimizer, decoder family, ...) has no implementation.
    #[error("unsupported {option} '{value}': not implemented")]
    Unsupported { option: &'static str, value: String },

    /// A batch with zero rows reached a loss or metric computation.
    #[error("batch must contain at least one row")]
    EmptyBatch,

    /// Tensor or matrix shapes disagree.
    #[error("shape mismatch: {message}")]
    ShapeMismatch { message: String },

    /// A checkpoint could not be read, written or applied.
    #[error("checkpoint {}: {message}", path.display())]
    Checkpoint { path: PathBuf, message: String },

    /// File-level I/O or (de)serialization failure outside checkpoints.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// Failure inside the tensor framework or another collaborator.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SsaError {
    /// Shorthand for [`SsaError::InvalidConfig`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`SsaError::ShapeMismatch`].
    pub fn shape(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }
}
