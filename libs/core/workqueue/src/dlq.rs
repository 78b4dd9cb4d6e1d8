//! Dead-letter publishing for deliveries that cannot be processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::{with_timeout, Delivery, Publish};
use crate::descriptor::{RetentionPolicy, StreamDescriptor};
use crate::error::WorkQueueError;

/// Dead letter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Subject the failed message was published under
    pub subject: String,
    /// Stream sequence of the failed message
    pub sequence: u64,
    pub delivered: u64,
    pub error: String,
    /// Raw payload, lossily decoded as UTF-8
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_delivery(delivery: &Delivery, error: &str) -> Self {
        Self {
            subject: delivery.subject.clone(),
            sequence: delivery.sequence,
            delivered: delivery.delivered,
            error: error.to_string(),
            payload: String::from_utf8_lossy(&delivery.payload).into_owned(),
            failed_at: Utc::now(),
        }
    }
}

/// Republishes failed deliveries to a dead-letter subject.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    publisher: Arc<dyn Publish>,
    subject: String,
    timeout: Duration,
}

impl DeadLetterPublisher {
    pub fn new(publisher: Arc<dyn Publish>, subject: impl Into<String>, timeout: Duration) -> Self {
        Self {
            publisher,
            subject: subject.into(),
            timeout,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Default dead-letter stream name for `stream`.
    pub fn stream_name(stream: &str) -> String {
        format!("{stream}_DLQ")
    }

    /// Default dead-letter subject for `stream`.
    pub fn default_subject(stream: &str) -> String {
        format!("{}_dlq.failed", stream.to_lowercase())
    }

    /// Stream capturing `subject`. Limits retention, so entries stay until
    /// they age out.
    pub fn stream_descriptor(stream_name: &str, subject: &str) -> StreamDescriptor {
        StreamDescriptor::new(stream_name, [subject])
            .with_description("Deliveries that could not be processed")
            .with_retention(RetentionPolicy::Limits)
            .with_max_messages(10_000)
            .with_max_age(Duration::from_secs(30 * 24 * 60 * 60))
    }

    /// Publish an entry for `delivery`. Returns the dead-letter sequence.
    pub async fn publish(&self, delivery: &Delivery, error: &str) -> Result<u64, WorkQueueError> {
        let entry = DeadLetterEntry::from_delivery(delivery, error);
        let payload = serde_json::to_vec(&entry)?;

        let ack = with_timeout(
            self.timeout,
            "dead-letter publish",
            self.publisher.publish(&self.subject, payload),
        )
        .await
        .map_err(|source| WorkQueueError::Publish {
            subject: self.subject.clone(),
            source,
        })?;

        debug!(
            subject = %delivery.subject,
            sequence = delivery.sequence,
            dead_letter_sequence = ack.sequence,
            "Moved delivery to dead-letter stream"
        );
        Ok(ack.sequence)
    }
}
