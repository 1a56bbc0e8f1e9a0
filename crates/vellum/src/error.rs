//! Error types for vellum operations.

use std::fmt;

/// Error type for vellum operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    // Decode errors
    /// Buffer is too small to contain a root pointer.
    DocumentTooSmall,
    /// Buffer failed validation; there is no usable root value.
    NoRoot,
    /// A value or pointer reaches outside the accessible byte range.
    OutOfRange { offset: u32, len: usize },
    /// Malformed encoded data (bad alignment, forward pointer, truncated
    /// payload, invalid UTF-8, ...).
    InvalidData(&'static str),

    // Encoder errors
    /// Encoder misuse or unencodable input.
    Encode(String),
    /// Operation attempted on an encoder already in the failed state.
    EncoderFailed,

    // JSON errors
    /// Failed to parse JSON input. `offset` is a byte position in the input.
    JsonParse { offset: usize, message: String },
    /// A value cannot be represented in JSON (non-finite float outside JSON5).
    JsonSerialize(String),

    // Path errors
    /// Key-path string failed to parse at the given byte offset.
    PathSyntax { offset: usize, message: &'static str },

    // Lookup errors
    /// Key or index not found.
    NotFound,

    // Shared-keys errors
    /// Persisted shared-keys state is malformed or conflicts with the table.
    SharedKeysState(&'static str),

    /// Operation is not supported in this configuration.
    Unsupported(&'static str),
    /// Invariant violation inside the library.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DocumentTooSmall => write!(f, "document too small for root pointer"),
            Error::NoRoot => write!(f, "data failed validation: no root value"),
            Error::OutOfRange { offset, len } => {
                write!(f, "offset {offset:#x} out of range (len={len})")
            }
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Encode(msg) => write!(f, "encode error: {msg}"),
            Error::EncoderFailed => write!(f, "encoder is in the failed state"),
            Error::JsonParse { offset, message } => {
                write!(f, "JSON parse error at byte {offset}: {message}")
            }
            Error::JsonSerialize(msg) => write!(f, "JSON serialize error: {msg}"),
            Error::PathSyntax { offset, message } => {
                write!(f, "key-path syntax error at byte {offset}: {message}")
            }
            Error::NotFound => write!(f, "not found"),
            Error::SharedKeysState(msg) => write!(f, "shared-keys state error: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type alias for vellum operations.
pub type Result<T> = std::result::Result<T, Error>;
