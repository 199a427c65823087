//! Codec error types

use thiserror::Error;

/// Result alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while converting between values and their wire form
#[derive(Debug, Error)]
pub enum CodecError {
    /// A tagged list (`__matrix__`, `__sparse__`, ...) had the wrong shape
    #[error("Malformed {tag} value: {reason}")]
    MalformedTag { tag: &'static str, reason: String },

    /// Element type name not known to this side
    #[error("Unknown element type: {0}")]
    UnknownDType(String),

    /// Buffer size does not agree with dtype and shape
    #[error("Matrix data holds {actual} bytes, shape requires {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Typed access with the wrong element type
    #[error("Element type mismatch: matrix is {actual}, requested {requested}")]
    DTypeMismatch {
        requested: &'static str,
        actual: &'static str,
    },

    /// Sparse triplet out of range or of unequal length
    #[error("Invalid sparse matrix: {0}")]
    InvalidSparse(String),

    /// Base64 payload could not be decoded
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Handle could not be resolved or allocated by the owning peer
    #[error("Reference error: {0}")]
    Reference(String),

    /// Message could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message could not be deserialized
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl CodecError {
    pub(crate) fn malformed(tag: &'static str, reason: impl Into<String>) -> Self {
        CodecError::MalformedTag {
            tag,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CodecError::Deserialization(err.to_string())
        } else {
            CodecError::Serialization(err.to_string())
        }
    }
}
