//! Broker capability contract.
//!
//! The provisioning and loop logic only talks to these traits. Two backends
//! implement them: [`crate::nats`] over async-nats and [`memory`], an
//! in-process model with the same work-queue semantics.

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FetchMode;
use crate::descriptor::{ConsumerDescriptor, StreamDescriptor};
use crate::error::BrokerError;

/// Occupancy of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    /// Distinct subjects with stored messages
    pub subjects: u64,
    pub consumers: usize,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// Progress of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerState {
    /// Matching messages not yet delivered
    pub pending: u64,
    /// Delivered but not yet acknowledged
    pub ack_pending: u64,
    pub redelivered: u64,
}

/// Broker confirmation of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    pub duplicate: bool,
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Acknowledge without waiting for confirmation.
    Ack,
    /// Acknowledge and wait for the broker to confirm it.
    AckConfirmed,
    /// Negative ack: redeliver after the delay, or immediately.
    Nak(Option<Duration>),
    /// Never redeliver.
    Term,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Ack => write!(f, "ack"),
            AckKind::AckConfirmed => write!(f, "ack+confirm"),
            AckKind::Nak(None) => write!(f, "nak"),
            AckKind::Nak(Some(delay)) => write!(f, "nak({}ms)", delay.as_millis()),
            AckKind::Term => write!(f, "term"),
        }
    }
}

/// Backend hook that settles one delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), BrokerError>;
}

/// A message delivered to a pull consumer.
pub struct Delivery {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Stream sequence of the message
    pub sequence: u64,
    /// Delivery attempt, starting at 1
    pub delivered: u64,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        sequence: u64,
        delivered: u64,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            delivered,
            acker,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }

    /// Settle the delivery. Consumes it, so a delivery is settled once.
    pub async fn ack(self, kind: AckKind) -> Result<(), BrokerError> {
        self.acker.acknowledge(kind).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Publish-only capability handed to producers.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError>;
}

/// Stream management.
#[async_trait]
pub trait Broker: Send + Sync {
    /// `Ok(None)` when the stream does not exist.
    async fn lookup_stream(&self, name: &str) -> Result<Option<Arc<dyn StreamApi>>, BrokerError>;

    async fn create_stream(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Arc<dyn StreamApi>, BrokerError>;
}

/// Handle on one stream.
#[async_trait]
pub trait StreamApi: Send + Sync {
    fn name(&self) -> &str;

    fn subjects(&self) -> &[String];

    async fn info(&self) -> Result<StreamState, BrokerError>;

    /// `Ok(None)` when the consumer does not exist.
    async fn lookup_consumer(&self, name: &str)
        -> Result<Option<Arc<dyn ConsumerApi>>, BrokerError>;

    async fn create_consumer(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Arc<dyn ConsumerApi>, BrokerError>;

    /// Returns whether a consumer was removed.
    async fn delete_consumer(&self, name: &str) -> Result<bool, BrokerError>;
}

/// Fetch capability handed to consumers.
#[async_trait]
pub trait ConsumerApi: Send + Sync {
    fn name(&self) -> &str;

    fn filter_subject(&self) -> Option<&str>;

    async fn fetch(&self, max: usize, mode: FetchMode) -> Result<Vec<Delivery>, BrokerError>;

    async fn info(&self) -> Result<ConsumerState, BrokerError>;
}

/// Bound a broker call by `timeout`.
pub async fn with_timeout<T, F>(
    timeout: Duration,
    operation: &str,
    future: F,
) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(format!(
            "{operation} after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Acknowledge for CountingAck {
        async fn acknowledge(&self, _kind: AckKind) -> Result<(), BrokerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivery_ack_settles_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let delivery = Delivery::new(
            "submit-tx",
            b"{}".to_vec(),
            7,
            1,
            Box::new(CountingAck(count.clone())),
        );
        assert!(!delivery.is_redelivery());
        assert!(format!("{delivery:?}").contains("sequence: 7"));

        delivery.ack(AckKind::Ack).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_timeout_reports_operation() {
        let result: Result<(), BrokerError> = with_timeout(
            Duration::from_millis(10),
            "stream lookup",
            std::future::pending(),
        )
        .await;

        match result {
            Err(BrokerError::Timeout(message)) => assert!(message.contains("stream lookup")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_kind_display() {
        assert_eq!(AckKind::Nak(Some(Duration::from_secs(2))).to_string(), "nak(2000ms)");
        assert_eq!(AckKind::AckConfirmed.to_string(), "ack+confirm");
    }
}
