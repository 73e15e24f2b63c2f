//! The AMI client proper: correlation, fan-out, reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use ringflow_ami_core::{Action, Block};

use crate::config::AmiClientConfig;
use crate::connection::{self, Connection};
use crate::error::{ClientError, Result};
use crate::events::{ConnectionStatus, EventPredicate, EventStream, RawEvent, Subscriber};

/// A request awaiting its correlated response.
///
/// The oneshot slot guarantees at most one fulfillment. The epoch
/// stamp guards against a response from a previous connection ever
/// reaching a waiter from the current one.
struct PendingAction {
    tx: oneshot::Sender<Block>,
    epoch: u64,
}

struct Inner {
    config: AmiClientConfig,
    /// Bumped on every connection loss; stale pending actions fail.
    epoch: AtomicU64,
    closed: AtomicBool,
    next_action_id: AtomicU64,
    next_subscriber_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAction>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    /// Write half of the live connection; `None` while reconnecting.
    /// The async mutex also serializes whole-block writes.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to the single persistent switch connection.
///
/// Cheap to clone; all clones share the connection, the pending-action
/// table, and the subscriber registry.
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient").finish_non_exhaustive()
    }
}

impl AmiClient {
    /// Connect to the switch, perform the login handshake, and start
    /// the background read loop.
    pub async fn connect(config: AmiClientConfig) -> Result<Self> {
        let next_action_id = AtomicU64::new(0);
        let login_id = next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (conn, writer) = Connection::establish(&config, &login_id.to_string()).await?;

        let (status_tx, _) = watch::channel(ConnectionStatus::Up { epoch: 1 });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            config,
            epoch: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            next_action_id,
            next_subscriber_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            writer: tokio::sync::Mutex::new(Some(writer)),
            status_tx,
            shutdown_tx,
        });

        tokio::spawn(run(inner.clone(), conn, shutdown_rx));

        Ok(Self { inner })
    }

    /// Reserve the next correlation id without sending anything.
    ///
    /// Callers that need to index switch events by ActionID before the
    /// response can arrive (events and responses race on the wire)
    /// reserve the id first, record it, then pass it to
    /// [`submit_with_id`](Self::submit_with_id).
    pub fn allocate_action_id(&self) -> u64 {
        self.inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send an action and await its correlated response.
    ///
    /// Exactly one of three outcomes holds for every submitted action:
    /// the matched response, [`ClientError::ActionTimeout`], or
    /// [`ClientError::ConnectionLost`].
    pub async fn submit(&self, action: Action) -> Result<Block> {
        let id = self.allocate_action_id();
        self.submit_with_id(id, action).await
    }

    /// Send an action under a previously reserved correlation id.
    pub async fn submit_with_id(&self, id: u64, action: Action) -> Result<Block> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let name = action.name().to_string();
        let block = action.into_block(&id.to_string());

        let (tx, rx) = oneshot::channel();
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.pending.lock().insert(id, PendingAction { tx, epoch });

        debug!("submitting {} (ActionID {})", name, id);
        if let Err(e) = self.write_block(&block).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.action_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The sender was dropped: the epoch changed underneath us.
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                warn!("{} (ActionID {}) timed out", name, id);
                Err(ClientError::ActionTimeout)
            }
        }
    }

    /// Subscribe to unsolicited events matching `predicate`.
    ///
    /// Every subscriber sees every matching event, in wire arrival
    /// order. Dropping the stream cancels the subscription.
    pub fn subscribe<F>(&self, predicate: F) -> EventStream
    where
        F: Fn(&RawEvent) -> bool + Send + Sync + 'static,
    {
        self.subscribe_arc(Arc::new(predicate))
    }

    /// Subscribe to every unsolicited event.
    pub fn subscribe_all(&self) -> EventStream {
        self.subscribe(|_| true)
    }

    fn subscribe_arc(&self, predicate: EventPredicate) -> EventStream {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .push(Subscriber { id, predicate, tx });
        EventStream {
            id,
            rx,
            registry: Arc::downgrade(&self.inner.subscribers),
        }
    }

    /// Watch connect/disconnect transitions.
    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut the client down: best-effort `Logoff`, stop the read loop,
    /// fail all pending actions with [`ClientError::ConnectionLost`],
    /// and end every subscription stream.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down switch connection");

        if let Some(writer) = self.inner.writer.lock().await.as_ref() {
            let id = self.inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
            let logoff = Action::new("Logoff").into_block(&id.to_string());
            if let Err(e) = connection::write_block(writer, &logoff).await {
                debug!("logoff not delivered: {}", e);
            }
        }

        let _ = self.inner.shutdown_tx.send(true);
    }

    async fn write_block(&self, block: &Block) -> Result<()> {
        let guard = self.inner.writer.lock().await;
        match guard.as_ref() {
            Some(writer) => connection::write_block(writer, block).await,
            None => Err(ClientError::ConnectionLost),
        }
    }
}

impl Inner {
    /// Route one decoded block: fulfill a pending action or fan out.
    ///
    /// Blocks carrying an `Event` header are always events, even when
    /// they also carry a `Response` field (OriginateResponse does).
    /// A response whose waiter is gone (timed out, or the follow-up
    /// block of an already-answered action) falls through to fan-out.
    fn dispatch(&self, block: Block) {
        let epoch = self.epoch.load(Ordering::SeqCst);

        if block.event_name().is_none() && block.response_status().is_some() {
            if let Some(id) = block.action_id().and_then(|s| s.parse::<u64>().ok()) {
                if let Some(pending) = self.pending.lock().remove(&id) {
                    if pending.epoch == epoch {
                        let _ = pending.tx.send(block);
                    } else {
                        // Correlation id from a previous connection;
                        // dropping the sender fails the waiter with
                        // ConnectionLost.
                        debug!("stale response for action {} discarded", id);
                    }
                    return;
                }
                debug!("late response for action {} passed to fan-out", id);
            }
        }

        self.broadcast(RawEvent { block, epoch });
    }

    /// Deliver an event to every matching subscriber, pruning any
    /// whose stream has been dropped.
    fn broadcast(&self, event: RawEvent) {
        self.subscribers.lock().retain(|sub| {
            if !(sub.predicate)(&event) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Connection lost: bump the epoch and fail every pending action.
    async fn mark_disconnected(&self) {
        let old_epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.writer.lock().await = None;

        let failed: Vec<u64> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(id, _)| id).collect()
        };
        if !failed.is_empty() {
            warn!(
                "connection lost on epoch {}; failing {} pending action(s)",
                old_epoch,
                failed.len()
            );
        }

        let _ = self.status_tx.send(ConnectionStatus::Down { epoch: old_epoch });
    }

    /// Final teardown after the read loop exits.
    async fn finish(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.writer.lock().await = None;
        self.pending.lock().clear();
        self.subscribers.lock().clear();
        let _ = self.status_tx.send(ConnectionStatus::Closed);
        info!("switch connection closed");
    }
}

/// Background read loop: decode blocks, dispatch, reconnect on loss.
async fn run(inner: Arc<Inner>, mut conn: Connection, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = conn.next_block() => match result {
                Ok(block) => inner.dispatch(block),
                Err(e) => {
                    warn!("switch connection failed: {}", e);
                    inner.mark_disconnected().await;
                    match reconnect(&inner, &mut shutdown_rx).await {
                        Some(new_conn) => conn = new_conn,
                        None => break,
                    }
                }
            }
        }
    }
    inner.finish().await;
}

/// Retry the connection with capped exponential backoff until it comes
/// back or shutdown is requested. Subscribers stay registered across
/// the gap; the login handshake is replayed before delivery resumes.
async fn reconnect(
    inner: &Arc<Inner>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Connection> {
    let mut delay = inner.config.reconnect_initial;
    loop {
        let wait = jitter(delay);
        info!("reconnecting to switch in {:.1}s", wait.as_secs_f64());
        tokio::select! {
            _ = shutdown_rx.changed() => return None,
            _ = tokio::time::sleep(wait) => {}
        }

        let login_id = inner.next_action_id.fetch_add(1, Ordering::SeqCst) + 1;
        match Connection::establish(&inner.config, &login_id.to_string()).await {
            Ok((conn, writer)) => {
                *inner.writer.lock().await = Some(writer);
                let epoch = inner.epoch.load(Ordering::SeqCst);
                let _ = inner.status_tx.send(ConnectionStatus::Up { epoch });
                info!("reconnected to switch on epoch {}", epoch);
                return Some(conn);
            }
            Err(e) => {
                warn!("reconnect attempt failed: {}", e);
                delay = (delay * 2).min(inner.config.reconnect_max);
            }
        }
    }
}

/// ±20% jitter so a fleet of clients doesn't stampede the switch.
fn jitter(delay: Duration) -> Duration {
    let factor = SmallRng::from_entropy().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(8));
            assert!(j <= Duration::from_secs(12));
        }
    }

    #[test]
    fn backoff_is_capped() {
        let max = Duration::from_secs(30);
        let mut delay = Duration::from_secs(1);
        for _ in 0..10 {
            delay = (delay * 2).min(max);
        }
        assert_eq!(delay, max);
    }
}
