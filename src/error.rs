//! Error types for the bandit library.
//!
//! Library code returns [`BanditError`]; the binary and storage layers wrap it
//! in `anyhow` with context.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BanditError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown {kind} {value:?}, expected one of: {expected}")]
    UnknownVariant {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Context length mismatch: expected {expected}, got {actual}")]
    ContextLength { expected: usize, actual: usize },

    #[error("Bad contexts shape: expected {expected:?}, got {actual:?}")]
    ContextShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Data lengths inconsistent: {0}")]
    LengthMismatch(String),

    #[error("Too many examples for memory_size: {incoming} new + {current} stored > {capacity}")]
    CapacityExceeded {
        incoming: usize,
        current: usize,
        capacity: usize,
    },

    #[error("Action {action} out of range for {num_actions} actions")]
    InvalidAction { action: usize, num_actions: usize },

    #[error("Unknown user id: {0}")]
    UnknownUser(String),

    #[error("Buffer is empty")]
    EmptyBuffer,

    #[error("Scaled contexts requested before rescale()")]
    NotScaled,

    #[error("Linear algebra failure: {0}")]
    LinearAlgebra(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, BanditError>;

impl From<serde_json::Error> for BanditError {
    fn from(e: serde_json::Error) -> Self {
        BanditError::Persistence(e.to_string())
    }
}
