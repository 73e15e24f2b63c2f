//! Engine error types.
//!
//! Call-level anomalies (an event invalid for the call's state, a
//! failed synthesis) are absorbed into transitions and logged, never
//! raised across call boundaries. The variants here cover the public
//! manager API only.

use thiserror::Error;

use crate::call::CallId;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the call manager's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Protocol client failure while issuing a command.
    #[error(transparent)]
    Client(#[from] ringflow_ami_client::ClientError),

    /// No active call under this identifier.
    #[error("no active call {0}")]
    CallNotFound(CallId),

    /// The engine has been shut down.
    #[error("call manager is shut down")]
    ShutDown,
}
