//! Tick scheduling shared by the producer and consumer loops.

use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::connection::ConnectionEvent;

/// Outcome of waiting for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    Fire,
    Stop,
}

/// Whether shutdown has been requested.
pub(crate) fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay`, returning early with [`Tick::Stop`] once shutdown is
/// requested. Connection events received meanwhile are logged.
pub(crate) async fn next_tick(
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
    events: &mut Option<broadcast::Receiver<ConnectionEvent>>,
) -> Tick {
    if is_shutdown(shutdown) {
        return Tick::Stop;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || is_shutdown(shutdown) {
                    return Tick::Stop;
                }
            }
            event = recv_event(events) => match event {
                Some(ConnectionEvent::Disconnected) => {
                    warn!("Broker connection lost, waiting for reconnect");
                }
                Some(ConnectionEvent::Connected) => {
                    info!("Broker connection restored");
                }
                Some(event) => debug!(event = %event, "Connection event"),
                None => {}
            },
            _ = &mut sleep => return Tick::Fire,
        }
    }
}

/// Receive the next connection event. Pends forever when there is no
/// channel, and drops the channel once it closes.
async fn recv_event(
    events: &mut Option<broadcast::Receiver<ConnectionEvent>>,
) -> Option<ConnectionEvent> {
    let Some(receiver) = events.as_mut() else {
        return std::future::pending().await;
    };

    let received = receiver.recv().await;
    match received {
        Ok(event) => Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "Skipped connection events");
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *events = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fires_after_delay() {
        let (_tx, mut rx) = watch::channel(false);
        let mut events = None;
        let tick = next_tick(Duration::from_millis(5), &mut rx, &mut events).await;
        assert_eq!(tick, Tick::Fire);
    }

    #[tokio::test]
    async fn test_stops_immediately_when_already_shut_down() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut events = None;
        let tick = next_tick(Duration::from_secs(60), &mut rx, &mut events).await;
        assert_eq!(tick, Tick::Stop);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let mut events = None;

        let waiter = tokio::spawn(async move {
            next_tick(Duration::from_secs(60), &mut rx, &mut events).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let tick = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick, Tick::Stop);
    }

    #[tokio::test]
    async fn test_connection_events_do_not_cut_the_tick_short() {
        let (_shutdown_tx, mut rx) = watch::channel(false);
        let (event_tx, event_rx) = broadcast::channel(8);
        let mut events = Some(event_rx);

        event_tx.send(ConnectionEvent::Disconnected).unwrap();
        event_tx.send(ConnectionEvent::Connected).unwrap();
        drop(event_tx);

        let tick = next_tick(Duration::from_millis(20), &mut rx, &mut events).await;
        assert_eq!(tick, Tick::Fire);
        assert!(events.is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let mut events = None;
        let tick = next_tick(Duration::from_secs(60), &mut rx, &mut events).await;
        assert_eq!(tick, Tick::Stop);
    }
}
