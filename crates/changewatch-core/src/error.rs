//! Normalization error types.

use thiserror::Error;

/// Errors raised while normalizing a raw change notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// A required field is absent.
    #[error("notification is missing required field '{field}'")]
    MissingField {
        /// The absent field.
        field: &'static str,
    },

    /// A field is present but has the wrong type.
    #[error("notification field '{field}' must be {expected}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// Description of the expected type.
        expected: &'static str,
    },
}

/// Result type for normalization.
pub type NormalizeResult<T> = Result<T, NormalizeError>;
