//! Error types for Arcane.

use thiserror::Error;

/// Result type alias for Arcane operations.
pub type Result<T> = std::result::Result<T, ArcaneError>;

/// Errors that can occur while building, training or sampling a model.
#[derive(Error, Debug)]
pub enum ArcaneError {
    /// Model or training configuration violates an invariant.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A forward call would exceed the context window.
    #[error("sequence of {len} positions exceeds context length {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// Token id outside of `[0, vocab_size)`.
    #[error("token id {id} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange { id: usize, vocab_size: usize },

    /// Inputs with incompatible shapes (ragged batches, targets vs inputs).
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Token stream too short to cut a single training window from.
    #[error("dataset has {len} tokens, need at least {needed}")]
    DataTooShort { len: usize, needed: usize },

    /// Checkpoint exists but cannot be parsed or does not fit the model.
    #[error("corrupt checkpoint {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    /// Tokenizer collaborator failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArcaneError {
    pub(crate) fn corrupt(path: &str, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
