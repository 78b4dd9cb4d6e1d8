//! Connection lifecycle shared by every backend: events, statistics, the
//! monitor task and the initial-connect retry loop.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Publish};
use crate::config::BackoffStrategy;
use crate::error::WorkQueueError;
use crate::metrics;

/// Capacity of the connection event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Transport lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// The server announced it is shutting down.
    LameDuck,
    /// A subscription fell behind; carries the subscription id.
    SlowConsumer(u64),
    ServerError(String),
    ClientError(String),
    Closed,
    Other(String),
}

impl ConnectionEvent {
    /// Stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Disconnected => "disconnected",
            ConnectionEvent::LameDuck => "lame_duck",
            ConnectionEvent::SlowConsumer(_) => "slow_consumer",
            ConnectionEvent::ServerError(_) => "server_error",
            ConnectionEvent::ClientError(_) => "client_error",
            ConnectionEvent::Closed => "closed",
            ConnectionEvent::Other(_) => "other",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::ServerError(_)
                | ConnectionEvent::ClientError(_)
                | ConnectionEvent::SlowConsumer(_)
        )
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::SlowConsumer(sid) => write!(f, "slow consumer (sid {sid})"),
            ConnectionEvent::ServerError(e) => write!(f, "server error: {e}"),
            ConnectionEvent::ClientError(e) => write!(f, "client error: {e}"),
            ConnectionEvent::Other(e) => write!(f, "{e}"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Counters maintained from connection events.
///
/// Only the monitor task writes here; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    reconnects: AtomicU64,
    disconnects: AtomicU64,
    errors: AtomicU64,
    disconnected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub reconnects: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub connected: bool,
    pub last_error: Option<String>,
}

impl ConnectionStats {
    pub fn record(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                if self.disconnected.swap(false, Ordering::SeqCst) {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                }
            }
            ConnectionEvent::Disconnected => {
                self.disconnected.store(true, Ordering::SeqCst);
                self.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionEvent::Closed => {
                self.disconnected.store(true, Ordering::SeqCst);
            }
            event if event.is_error() => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                *self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(event.to_string());
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            reconnects: self.reconnects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            connected: !self.disconnected.load(Ordering::SeqCst),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// What the lifecycle controller needs from an established connection.
#[async_trait]
pub trait ManagedConnection: Send + Sync + 'static {
    fn broker(&self) -> Arc<dyn Broker>;

    fn publisher(&self) -> Arc<dyn Publish>;

    /// Subscribe to connection events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Bound applied to each broker operation.
    fn operation_timeout(&self) -> Duration;

    /// Flush outbound traffic and release the transport. Consumes the
    /// connection, so it runs at most once.
    async fn close(self) -> Result<(), WorkQueueError>;
}

/// Spawn the task that logs connection events and keeps `stats` current.
///
/// The task ends after a `Closed` event or once every sender is gone.
pub fn spawn_event_monitor(
    mut events: broadcast::Receiver<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    stats.record(&event);
                    metrics::record_connection_event(event.kind());
                    match &event {
                        ConnectionEvent::Connected => {
                            let snapshot = stats.snapshot();
                            info!(reconnects = snapshot.reconnects, "Connected to broker");
                        }
                        ConnectionEvent::Disconnected => {
                            warn!("Disconnected from broker, transport will reconnect");
                        }
                        ConnectionEvent::Closed => {
                            info!("Connection closed");
                            break;
                        }
                        ConnectionEvent::LameDuck => {
                            warn!("Broker entered lame duck mode");
                        }
                        event if event.is_error() => {
                            warn!(event = %event, "Connection error");
                        }
                        event => debug!(event = %event, "Connection event"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection monitor lagged behind events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Run `connect` until it succeeds or `attempts` are used up, sleeping per
/// `backoff` in between. On failure returns the attempt count and last error.
pub async fn connect_with_retry<T, E, F, Fut>(
    attempts: u32,
    backoff: &BackoffStrategy,
    mut connect: F,
) -> Result<T, (u32, E)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match connect().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err((attempt, e)),
            Err(e) => {
                let delay = backoff.delay(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
