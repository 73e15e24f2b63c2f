//! Client configuration.

use std::time::Duration;

/// Configuration for [`AmiClient`](crate::AmiClient).
///
/// Loading these values from files or the environment is the
/// application's concern; this struct is the boundary.
#[derive(Debug, Clone)]
pub struct AmiClientConfig {
    /// Manager interface address, e.g. `127.0.0.1:5038`.
    pub address: String,
    /// Manager username.
    pub username: String,
    /// Manager secret.
    pub secret: String,
    /// Deadline for a submitted action's correlated response.
    pub action_timeout: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_initial: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for AmiClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5038".to_string(),
            username: "ringflow".to_string(),
            secret: "change_me".to_string(),
            action_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl AmiClientConfig {
    /// Configuration for the given address and credentials, with
    /// default timeouts.
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }
}
