//! Error types for uid parsing.

use thiserror::Error;

/// Errors that can occur when parsing a uid.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The uid string is empty.
    #[error("uid cannot be empty")]
    Empty,

    /// The uid carries the prefix of a different object kind.
    #[error("invalid uid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The uid is missing the underscore separator.
    #[error("uid missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the uid is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A resource version that is not a decimal integer.
    #[error("invalid resource version: {0}")]
    InvalidVersion(String),
}

impl IdError {
    /// Returns true if this error indicates a uid of the wrong kind.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
