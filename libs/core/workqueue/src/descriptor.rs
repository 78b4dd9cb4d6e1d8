//! Stream and consumer descriptors, plus compile-time queue definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::WorkQueueError;
use crate::subject;

/// Message retention policy of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until a limit (age, bytes, count) evicts them.
    Limits,
    /// Keep messages while a consumer with matching interest has not acked them.
    Interest,
    /// Remove a message once the single interested consumer acks it.
    #[default]
    WorkQueue,
}

/// Storage class of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    /// Volatile, lost on broker restart.
    Memory,
    /// Durable, persisted to disk.
    #[default]
    File,
}

/// What a full stream does with a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Evict the oldest messages to make room.
    #[default]
    Old,
    /// Reject the new message.
    New,
}

/// Acknowledgement policy of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckPolicy {
    /// Each delivery must be acknowledged; unacked deliveries are redelivered after ack-wait.
    #[default]
    Explicit,
    /// Deliveries count as acknowledged when sent.
    None,
}

/// Declared shape of a stream.
///
/// `max_age` of zero and negative byte/message limits mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageClass,
    pub max_age: Duration,
    pub max_bytes: i64,
    pub max_messages: i64,
    pub discard: DiscardPolicy,
    pub replicas: usize,
}

impl StreamDescriptor {
    /// A work-queue stream over `subjects` with no limits.
    pub fn new<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            description: None,
            subjects: subjects.into_iter().map(Into::into).collect(),
            retention: RetentionPolicy::WorkQueue,
            storage: StorageClass::File,
            max_age: Duration::ZERO,
            max_bytes: -1,
            max_messages: -1,
            discard: DiscardPolicy::Old,
            replicas: 1,
        }
    }

    /// Build from queue definition trait constants.
    pub fn from_def<D: QueueDef>() -> Self {
        let description = (!D::DESCRIPTION.is_empty()).then(|| D::DESCRIPTION.to_string());
        Self {
            description,
            storage: D::STORAGE,
            max_age: Duration::from_secs(D::MAX_AGE_SECS),
            max_bytes: D::MAX_BYTES,
            max_messages: D::MAX_MESSAGES,
            ..Self::new(D::STREAM_NAME, D::SUBJECTS.iter().copied())
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_storage(mut self, storage: StorageClass) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: i64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_messages(mut self, max_messages: i64) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_discard(mut self, discard: DiscardPolicy) -> Self {
        self.discard = discard;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Whether a literal subject is captured by this stream.
    pub fn accepts(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject))
    }

    pub fn validate(&self) -> Result<(), WorkQueueError> {
        validate_name("stream", &self.name)?;

        if self.subjects.is_empty() {
            return Err(WorkQueueError::Config(format!(
                "stream '{}' must declare at least one subject",
                self.name
            )));
        }
        for (index, pattern) in self.subjects.iter().enumerate() {
            if !subject::is_valid(pattern, true) {
                return Err(WorkQueueError::Config(format!(
                    "stream '{}' has invalid subject '{pattern}'",
                    self.name
                )));
            }
            if let Some(other) = self.subjects[index + 1..]
                .iter()
                .find(|other| subject::overlaps(pattern, other))
            {
                return Err(WorkQueueError::Config(format!(
                    "stream '{}' subjects '{pattern}' and '{other}' overlap",
                    self.name
                )));
            }
        }
        if self.replicas == 0 {
            return Err(WorkQueueError::Config(format!(
                "stream '{}' needs at least one replica",
                self.name
            )));
        }
        Ok(())
    }
}

/// Declared shape of a durable pull consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    /// Durable name, unique per stream
    pub name: String,
    pub description: Option<String>,
    /// Sub-pattern of the stream's subjects; `None` receives everything
    pub filter_subject: Option<String>,
    pub ack_policy: AckPolicy,
    /// Redelivery window for unacknowledged deliveries
    pub ack_wait: Duration,
    /// Delivery attempts per message, `-1` for unlimited
    pub max_deliver: i64,
}

impl ConsumerDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            filter_subject: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
        }
    }

    pub fn from_def<D: QueueDef>() -> Self {
        Self {
            filter_subject: D::FILTER_SUBJECT.map(str::to_string),
            ack_wait: Duration::from_secs(D::ACK_WAIT_SECS),
            max_deliver: D::MAX_DELIVER,
            ..Self::new(D::CONSUMER_NAME)
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    /// Whether this consumer is interested in the literal `subject`.
    pub fn is_interested_in(&self, subject: &str) -> bool {
        self.filter_subject
            .as_deref()
            .map_or(true, |filter| subject::matches(filter, subject))
    }

    /// Validate against the subjects of the stream the consumer will live on.
    pub fn validate(&self, stream_subjects: &[String]) -> Result<(), WorkQueueError> {
        validate_name("consumer", &self.name)?;

        if let Some(filter) = &self.filter_subject {
            if !subject::is_valid(filter, true) {
                return Err(WorkQueueError::Config(format!(
                    "consumer '{}' has invalid filter subject '{filter}'",
                    self.name
                )));
            }
            if !stream_subjects
                .iter()
                .any(|pattern| subject::is_subset(filter, pattern))
            {
                return Err(WorkQueueError::Config(format!(
                    "consumer '{}' filter '{filter}' is not contained in stream subjects {stream_subjects:?}",
                    self.name
                )));
            }
        }
        if self.ack_wait.is_zero() {
            return Err(WorkQueueError::Config(format!(
                "consumer '{}' ack wait must be positive",
                self.name
            )));
        }
        if self.max_deliver == 0 || self.max_deliver < -1 {
            return Err(WorkQueueError::Config(format!(
                "consumer '{}' max deliver must be -1 or positive, got {}",
                self.name, self.max_deliver
            )));
        }
        Ok(())
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), WorkQueueError> {
    if name.is_empty() {
        return Err(WorkQueueError::Config(format!("{kind} name must not be empty")));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
    {
        return Err(WorkQueueError::Config(format!(
            "{kind} name '{name}' must not contain whitespace, '.', '*', '>', '/' or '\\'"
        )));
    }
    Ok(())
}

/// Queue definition trait (for type-safe constants).
///
/// Implement this trait to declare a stream and its primary consumer.
pub trait QueueDef {
    /// Stream name
    const STREAM_NAME: &'static str;

    /// Subject patterns captured by the stream
    const SUBJECTS: &'static [&'static str];

    /// Durable consumer name
    const CONSUMER_NAME: &'static str;

    const DESCRIPTION: &'static str = "";

    const STORAGE: StorageClass = StorageClass::File;

    /// Maximum message age in seconds (default: unlimited)
    const MAX_AGE_SECS: u64 = 0;

    const MAX_BYTES: i64 = -1;

    const MAX_MESSAGES: i64 = -1;

    /// Consumer ack wait in seconds (default: 30)
    const ACK_WAIT_SECS: u64 = 30;

    const MAX_DELIVER: i64 = -1;

    const FILTER_SUBJECT: Option<&'static str> = None;
}

/// Transaction submission queue.
pub struct SubmitTxQueue;

impl QueueDef for SubmitTxQueue {
    const STREAM_NAME: &'static str = "stream-1";
    const SUBJECTS: &'static [&'static str] = &["submit-tx"];
    const CONSUMER_NAME: &'static str = "consumer-1";
    const DESCRIPTION: &'static str = "Submitted transactions awaiting processing";
    const STORAGE: StorageClass = StorageClass::Memory;
    const MAX_AGE_SECS: u64 = 24 * 60 * 60;
    const MAX_BYTES: i64 = 64 * 1024 * 1024;
}

/// Geo-partitioned UI events.
pub struct EventsQueue;

impl QueueDef for EventsQueue {
    const STREAM_NAME: &'static str = "EVENTS";
    const SUBJECTS: &'static [&'static str] = &["events.>"];
    const CONSUMER_NAME: &'static str = "processor-1";
    const DESCRIPTION: &'static str = "User interface events by region";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_from_def() {
        let stream = StreamDescriptor::from_def::<SubmitTxQueue>();
        assert_eq!(stream.name, "stream-1");
        assert_eq!(stream.subjects, vec!["submit-tx".to_string()]);
        assert_eq!(stream.retention, RetentionPolicy::WorkQueue);
        assert_eq!(stream.storage, StorageClass::Memory);
        assert_eq!(stream.max_age, Duration::from_secs(86_400));
        assert!(stream.description.is_some());
        assert!(stream.validate().is_ok());

        let consumer = ConsumerDescriptor::from_def::<SubmitTxQueue>();
        assert_eq!(consumer.name, "consumer-1");
        assert_eq!(consumer.ack_policy, AckPolicy::Explicit);
        assert!(consumer.validate(&stream.subjects).is_ok());
    }

    #[test]
    fn test_stream_accepts() {
        let stream = StreamDescriptor::from_def::<EventsQueue>();
        assert!(stream.accepts("events.us.page_loaded"));
        assert!(!stream.accepts("events"));
        assert!(!stream.accepts("orders.created"));
    }

    #[test]
    fn test_stream_validation() {
        assert!(StreamDescriptor::new("", ["a"]).validate().is_err());
        assert!(StreamDescriptor::new("bad.name", ["a"]).validate().is_err());
        assert!(StreamDescriptor::new("bad name", ["a"]).validate().is_err());
        assert!(StreamDescriptor::new("EVENTS", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(StreamDescriptor::new("EVENTS", ["events..x"]).validate().is_err());
        assert!(StreamDescriptor::new("EVENTS", ["events.>", "events.us"])
            .validate()
            .is_err());
        assert!(StreamDescriptor::new("EVENTS", ["events.>"])
            .with_replicas(0)
            .validate()
            .is_err());
        assert!(StreamDescriptor::new("EVENTS", ["events.>", "orders.>"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_consumer_filter_must_be_contained() {
        let subjects = vec!["events.>".to_string()];

        assert!(ConsumerDescriptor::new("processor-us")
            .with_filter("events.us.>")
            .validate(&subjects)
            .is_ok());

        let err = ConsumerDescriptor::new("processor-orders")
            .with_filter("orders.>")
            .validate(&subjects)
            .unwrap_err();
        assert!(err.to_string().contains("not contained"));

        assert!(ConsumerDescriptor::new("processor-x")
            .with_filter("events..x")
            .validate(&subjects)
            .is_err());
    }

    #[test]
    fn test_consumer_limits_validation() {
        let subjects = vec!["events.>".to_string()];
        assert!(ConsumerDescriptor::new("c")
            .with_ack_wait(Duration::ZERO)
            .validate(&subjects)
            .is_err());
        assert!(ConsumerDescriptor::new("c")
            .with_max_deliver(0)
            .validate(&subjects)
            .is_err());
        assert!(ConsumerDescriptor::new("c")
            .with_max_deliver(5)
            .validate(&subjects)
            .is_ok());
    }

    #[test]
    fn test_consumer_interest() {
        let unfiltered = ConsumerDescriptor::new("all");
        assert!(unfiltered.is_interested_in("events.eu.clicked"));

        let us = ConsumerDescriptor::new("us").with_filter("events.us.>");
        assert!(us.is_interested_in("events.us.clicked"));
        assert!(!us.is_interested_in("events.eu.clicked"));
    }
}
