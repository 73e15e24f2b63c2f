//! Client error types.

use thiserror::Error;

use ringflow_ami_core::CodecError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the AMI client.
///
/// Transport-level failures are recovered internally via reconnect;
/// callers of [`submit`](crate::AmiClient::submit) only ever see the
/// per-action variants (`ActionTimeout`, `ConnectionLost`) plus
/// `Closed` after shutdown. `AuthRejected` and `Transport` reach the
/// operator from the initial [`connect`](crate::AmiClient::connect).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The switch rejected the login credentials.
    #[error("switch rejected login: {0}")]
    AuthRejected(String),

    /// Connection-level I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The byte stream violated block framing.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No correlated response arrived within the configured deadline.
    #[error("no response to action within the deadline")]
    ActionTimeout,

    /// The connection was lost (epoch changed) before the action's
    /// response arrived. The switch-side outcome is unknown.
    #[error("connection lost before the action completed")]
    ConnectionLost,

    /// The client has been shut down.
    #[error("client is shut down")]
    Closed,
}
