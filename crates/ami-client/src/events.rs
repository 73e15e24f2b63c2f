//! Event subscription types.
//!
//! Unsolicited blocks from the switch fan out to every registered
//! subscriber whose predicate matches, in wire arrival order. Each
//! subscriber gets its own queue; a slow consumer never holds up
//! another. Dropping an [`EventStream`] cancels the subscription.

use std::sync::Arc;

use tokio::sync::mpsc;

use ringflow_ami_core::Block;

/// A decoded unsolicited block plus the connection epoch it arrived on.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// The decoded block.
    pub block: Block,
    /// Connection epoch at arrival time. Events from before a
    /// reconnect carry the old epoch.
    pub epoch: u64,
}

impl RawEvent {
    /// The `Event` name, if present.
    pub fn name(&self) -> Option<&str> {
        self.block.event_name()
    }
}

/// Connection state reported through
/// [`connection_status`](crate::AmiClient::connection_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Connected and logged in, on the given epoch.
    Up { epoch: u64 },
    /// Transport lost; the client is retrying with backoff.
    Down { epoch: u64 },
    /// The client was shut down and will not reconnect.
    Closed,
}

/// Predicate deciding which events a subscriber receives.
pub type EventPredicate = Arc<dyn Fn(&RawEvent) -> bool + Send + Sync>;

pub(crate) struct Subscriber {
    pub id: u64,
    pub predicate: EventPredicate,
    pub tx: mpsc::UnboundedSender<RawEvent>,
}

/// An active event subscription.
///
/// Yields matching events in arrival order until the client shuts
/// down or the stream is dropped.
pub struct EventStream {
    pub(crate) id: u64,
    pub(crate) rx: mpsc::UnboundedReceiver<RawEvent>,
    pub(crate) registry: std::sync::Weak<parking_lot::Mutex<Vec<Subscriber>>>,
}

impl EventStream {
    /// Receive the next matching event, or `None` once the client is
    /// gone and the queue is drained.
    pub async fn next(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_next(&mut self) -> Option<RawEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().retain(|s| s.id != self.id);
        }
    }
}

impl futures::Stream for EventStream {
    type Item = RawEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
