//! Managed async-nats connection.

use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::jetstream::JetStreamBroker;
use crate::broker::{Broker, Publish};
use crate::config::ConnectionConfig;
use crate::connection::{
    connect_with_retry, spawn_event_monitor, ConnectionEvent, ConnectionSnapshot,
    ConnectionStats, ManagedConnection, EVENT_CHANNEL_CAPACITY,
};
use crate::error::WorkQueueError;

/// How long `close` waits for the monitor task to stop after `Closed`.
const MONITOR_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

impl From<Event> for ConnectionEvent {
    fn from(event: Event) -> Self {
        match event {
            Event::Connected => ConnectionEvent::Connected,
            Event::Disconnected => ConnectionEvent::Disconnected,
            Event::LameDuckMode => ConnectionEvent::LameDuck,
            Event::SlowConsumer(sid) => ConnectionEvent::SlowConsumer(sid),
            Event::ServerError(e) => ConnectionEvent::ServerError(e.to_string()),
            Event::ClientError(e) => ConnectionEvent::ClientError(e.to_string()),
            Event::Closed => ConnectionEvent::Closed,
            other => ConnectionEvent::Other(format!("{other:?}")),
        }
    }
}

/// Build client options from the connection configuration.
fn connect_options(
    config: &ConnectionConfig,
    events: broadcast::Sender<ConnectionEvent>,
) -> ConnectOptions {
    let backoff = config.reconnect_backoff.clone();
    // The client treats zero reconnects as unlimited.
    let max_reconnects = if config.auto_reconnect {
        config.max_reconnects.max(1)
    } else {
        1
    };

    ConnectOptions::new()
        .name(&config.name)
        .ping_interval(config.ping_interval)
        .connection_timeout(config.connection_timeout)
        .request_timeout(Some(config.operation_timeout))
        .client_capacity(config.reconnect_buffer.max(1))
        .max_reconnects(max_reconnects)
        .reconnect_delay_callback(move |attempt| {
            backoff.delay(u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
        })
        .event_callback(move |event| {
            let events = events.clone();
            async move {
                // No receivers only means nobody is watching yet.
                let _ = events.send(event.into());
            }
        })
}

/// Connection to a NATS server with JetStream enabled.
///
/// Owns the client, the event channel and the monitor task. Dropping the
/// manager without calling [`ManagedConnection::close`] skips the drain and
/// leaves buffered publishes unflushed.
pub struct ConnectionManager {
    client: Client,
    broker: JetStreamBroker,
    config: ConnectionConfig,
    events: broadcast::Sender<ConnectionEvent>,
    stats: Arc<ConnectionStats>,
    monitor: JoinHandle<()>,
}

impl ConnectionManager {
    /// Connect, retrying the initial connection per the configuration.
    #[instrument(skip(config), fields(address = %config.address, name = %config.name))]
    pub async fn connect(config: ConnectionConfig) -> Result<Self, WorkQueueError> {
        let (events, monitor_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stats = Arc::new(ConnectionStats::default());
        let monitor = spawn_event_monitor(monitor_rx, stats.clone());

        let attempts = config.connect_attempts();
        let result = connect_with_retry(attempts, &config.reconnect_backoff, || {
            connect_options(&config, events.clone()).connect(config.address.as_str())
        })
        .await;

        let client = match result {
            Ok(client) => client,
            Err((attempts, e)) => {
                monitor.abort();
                return Err(WorkQueueError::Connection {
                    address: config.address.clone(),
                    attempts,
                    message: e.to_string(),
                });
            }
        };

        info!(
            server = %client.server_info().server_name,
            version = %client.server_info().version,
            "Connected to NATS"
        );

        let broker = JetStreamBroker::new(client.clone(), config.operation_timeout);
        Ok(Self {
            client,
            broker,
            config,
            events,
            stats,
            monitor,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jetstream(&self) -> &JetStreamBroker {
        &self.broker
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> ConnectionSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl ManagedConnection for ConnectionManager {
    fn broker(&self) -> Arc<dyn Broker> {
        Arc::new(self.broker.clone())
    }

    fn publisher(&self) -> Arc<dyn Publish> {
        Arc::new(self.broker.clone())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    /// Drain the client: unsubscribe, flush pending publishes, then close.
    ///
    /// Waits for the transport's `Closed` event within the operation timeout.
    #[instrument(skip(self), fields(address = %self.config.address))]
    async fn close(self) -> Result<(), WorkQueueError> {
        info!("Draining connection");
        let started = Instant::now();
        let mut closed = self.events.subscribe();

        let drained = tokio::time::timeout(self.config.operation_timeout, async {
            self.client
                .drain()
                .await
                .map_err(|e| WorkQueueError::Drain(e.to_string()))?;
            wait_for_closed(&mut closed).await;
            Ok(())
        })
        .await;

        let snapshot = self.stats.snapshot();
        if tokio::time::timeout(MONITOR_SHUTDOWN_GRACE, self.monitor)
            .await
            .is_err()
        {
            warn!("Connection monitor did not stop in time");
        }

        match drained {
            Ok(Ok(())) => {
                info!(
                    reconnects = snapshot.reconnects,
                    disconnects = snapshot.disconnects,
                    errors = snapshot.errors,
                    "Connection closed"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WorkQueueError::Timeout {
                operation: "connection drain".to_string(),
                elapsed_ms: started.elapsed().as_millis(),
            }),
        }
    }
}

/// Resolve once `Closed` is observed or the event channel is gone.
async fn wait_for_closed(events: &mut broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}
