//! Persistent client for the Asterisk Manager Interface.
//!
//! One [`AmiClient`] owns the single TCP connection to the switch. All
//! call-level code goes through it:
//!
//! - [`AmiClient::submit`] sends an action and resolves to the
//!   correlated response (or fails with a timeout / connection loss,
//!   never both).
//! - [`AmiClient::subscribe`] hands out an ordered stream of the
//!   unsolicited events matching a predicate; every subscriber sees
//!   every matching event.
//! - [`AmiClient::connection_status`] exposes connect/disconnect
//!   transitions so higher layers can fail calls the switch can no
//!   longer confirm.
//!
//! The client reconnects on its own with capped exponential backoff.
//! Each reconnect bumps the connection epoch: every action still
//! pending on the old connection fails with
//! [`ClientError::ConnectionLost`], and correlation ids from the old
//! connection can never fulfill a new waiter.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;

pub use client::AmiClient;
pub use config::AmiClientConfig;
pub use error::{ClientError, Result};
pub use events::{ConnectionStatus, EventStream, RawEvent};
