//! Error types for the Tessera wire types.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode data as CBOR
    #[error("failed to encode CBOR: {0}")]
    CborEncode(String),

    /// Failed to decode CBOR data
    #[error("failed to decode CBOR: {0}")]
    CborDecode(String),

    /// Encoded body exceeds maximum allowed size
    #[error("body too large: {size} bytes exceeds maximum {max}")]
    BodyTooLarge {
        /// Actual encoded size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Identifier has the wrong length
    #[error("invalid identifier length: expected {expected} bytes, got {actual}")]
    InvalidIdLength {
        /// Expected length in bytes
        expected: usize,
        /// Actual length
        actual: usize,
    },
}

/// Convenient Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
