//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding canonical CBOR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// NaN cannot be encoded deterministically.
    #[error("NaN is not encodable")]
    NanForbidden,

    /// Indefinite-length items are not canonical.
    #[error("indefinite-length items are forbidden")]
    IndefiniteLength,

    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Text item held invalid UTF-8.
    #[error("invalid UTF-8 in text item")]
    InvalidUtf8,

    /// The bytes violate a canonical-form rule or are structurally invalid.
    #[error("invalid CBOR: {0}")]
    Invalid(String),

    /// A claimed length exceeds the decoder's allocation limit.
    #[error("size limit exceeded: claimed {claimed}, max {max}")]
    SizeLimit {
        /// Length claimed by the input.
        claimed: u64,
        /// Maximum the decoder will allocate.
        max: u64,
    },

    /// The value's shape does not match what the caller expected.
    #[error("unexpected shape: {0}")]
    UnexpectedShape(String),
}

impl CodecError {
    /// Creates an [`CodecError::Invalid`] with the given message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Creates an [`CodecError::UnexpectedShape`] with the given message.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::UnexpectedShape(message.into())
    }
}
