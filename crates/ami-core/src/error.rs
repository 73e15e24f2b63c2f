//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors produced while framing the byte stream into blocks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A non-blank line could not be split into `Key: Value`.
    ///
    /// The decoder cannot resynchronize mid-stream; the caller is
    /// expected to drop the connection.
    #[error("malformed protocol line: {line:?}")]
    MalformedBlock {
        /// The offending line, as received.
        line: String,
    },
}
