//! Lifecycle controller: provision, run the selected loop, always close.

use eyre::{Result, WrapErr};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use workqueue::{
    ConsumerLoop, ConsumerSummary, DeadLetterPublisher, ManagedConnection, Processor,
    ProducerLoop, ProducerSummary, Provisioner, WorkQueueError,
};

use crate::config::Config;
use crate::Role;

/// What the selected loop did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published(ProducerSummary),
    Consumed(ConsumerSummary),
}

/// Await `connect` unless shutdown is requested first.
///
/// Returns `Ok(None)` on shutdown; the pending connect, retries included, is
/// dropped and there is nothing to close.
pub async fn connect_until_shutdown<C, F>(
    connect: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<C>, WorkQueueError>
where
    F: Future<Output = Result<C, WorkQueueError>>,
{
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => {
            info!("Shutdown requested before the connection was established");
            Ok(None)
        }
        result = connect => result.map(Some),
    }
}

/// Resolves once `shutdown` is true. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run `role` on `connection` until `shutdown` fires or the loop fails.
///
/// The connection is closed on every path. A loop error takes precedence
/// over a close error.
pub async fn run_role<C: ManagedConnection>(
    connection: C,
    role: Role,
    config: &Config,
    processor: Arc<dyn Processor>,
    shutdown: watch::Receiver<bool>,
) -> Result<Outcome> {
    let result = drive(&connection, role, config, processor, shutdown).await;

    info!(role = %role, "Closing connection");
    let closed = connection.close().await;

    match (result, closed) {
        (Ok(outcome), Ok(())) => {
            log_outcome(&outcome);
            Ok(outcome)
        }
        (Ok(outcome), Err(e)) => {
            log_outcome(&outcome);
            Err(e).wrap_err("Failed to close connection")
        }
        (Err(e), closed) => {
            if let Err(close_error) = closed {
                warn!(error = %close_error, "Close after failure also failed");
            }
            error!(role = %role, error = %e, "Worker stopped with error");
            Err(e)
        }
    }
}

async fn drive<C: ManagedConnection>(
    connection: &C,
    role: Role,
    config: &Config,
    processor: Arc<dyn Processor>,
    shutdown: watch::Receiver<bool>,
) -> Result<Outcome> {
    let timeout = connection.operation_timeout();
    let provisioner = Provisioner::new(connection.broker(), timeout);

    let stream = provisioner
        .ensure_stream(&config.stream())
        .await
        .wrap_err_with(|| format!("Failed to provision stream '{}'", config.stream_name))?;

    match role {
        Role::Publish => {
            let producer =
                ProducerLoop::new(connection.publisher(), stream, config.producer(), timeout)
                    .wrap_err("Invalid producer configuration")?
                    .with_events(connection.events());

            let summary = producer.run(shutdown).await.wrap_err("Producer loop failed")?;
            Ok(Outcome::Published(summary))
        }
        Role::Subscribe => {
            let consumer = provisioner
                .ensure_consumer(&stream, &config.consumer())
                .await
                .wrap_err_with(|| {
                    format!("Failed to provision consumer '{}'", config.consumer_name)
                })?;

            let mut consumer_loop = ConsumerLoop::new(
                consumer,
                stream,
                processor,
                config.consumer_loop(),
                timeout,
            )
            .with_events(connection.events());

            if let Some(descriptor) = config.dead_letter_stream() {
                provisioner
                    .ensure_stream(&descriptor)
                    .await
                    .wrap_err_with(|| {
                        format!("Failed to provision dead-letter stream '{}'", descriptor.name)
                    })?;
                consumer_loop = consumer_loop.with_dead_letter(DeadLetterPublisher::new(
                    connection.publisher(),
                    &config.dead_letter_subject,
                    timeout,
                ));
            }

            let summary = consumer_loop
                .run(shutdown)
                .await
                .wrap_err("Consumer loop failed")?;
            Ok(Outcome::Consumed(summary))
        }
    }
}

fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Published(summary) => {
            info!(published = summary.published, "Producer stopped");
        }
        Outcome::Consumed(summary) => {
            info!(
                fetched = summary.fetched,
                acked = summary.acked,
                decode_failures = summary.decode_failures,
                dead_lettered = summary.dead_lettered,
                nacked = summary.nacked,
                terminated = summary.terminated,
                "Consumer stopped"
            );
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, starting graceful shutdown");
    }

    Ok(())
}

/// Flip `shutdown` once a termination signal arrives.
pub fn spawn_signal_watcher(shutdown: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {:?}", e);
        }
        let _ = shutdown.send(true);
    })
}
