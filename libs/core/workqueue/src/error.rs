//! Error types for provisioning, publishing and consuming work items.

use std::fmt;
use thiserror::Error;

/// JetStream API error codes the crate reacts to.
pub mod codes {
    /// `stream not found`
    pub const STREAM_NOT_FOUND: u64 = 10059;
    /// `consumer not found`
    pub const CONSUMER_NOT_FOUND: u64 = 10014;
    /// `multiple non-filtered consumers not allowed on workqueue stream`
    pub const WORKQUEUE_MULTIPLE_UNFILTERED: u64 = 10099;
    /// `filtered consumer not unique on workqueue stream`
    pub const WORKQUEUE_NOT_UNIQUE: u64 = 10100;
    /// `stream name already in use with a different configuration`
    pub const STREAM_NAME_IN_USE: u64 = 10058;
    /// `subjects overlap with an existing stream`
    pub const STREAM_SUBJECT_OVERLAP: u64 = 10065;
    /// `consumer already exists`
    pub const CONSUMER_ALREADY_EXISTS: u64 = 10148;

    /// Codes that signal a topology mistake rather than a transient failure.
    pub const CAPABILITY: [u64; 5] = [
        WORKQUEUE_MULTIPLE_UNFILTERED,
        WORKQUEUE_NOT_UNIQUE,
        STREAM_NAME_IN_USE,
        STREAM_SUBJECT_OVERLAP,
        CONSUMER_ALREADY_EXISTS,
    ];
}

/// Error reported by a broker backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The stream or consumer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The broker refused the operation because of the stream/consumer topology.
    #[error("{message} (error code {code})")]
    Capability { code: u64, message: String },

    /// No stream is bound to the published subject.
    #[error("no stream accepts subject '{0}'")]
    NoStream(String),

    /// The stream refused the message (limits reached with discard-new).
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl BrokerError {
    /// Build an error from a JetStream API error body.
    pub fn from_api(err_code: u64, description: impl Into<String>) -> Self {
        let description = description.into();
        match err_code {
            codes::STREAM_NOT_FOUND | codes::CONSUMER_NOT_FOUND => Self::NotFound(description),
            code if codes::CAPABILITY.contains(&code) => Self::Capability {
                code,
                message: description,
            },
            code => Self::Request(format!("{description} (error code {code})")),
        }
    }

    /// Classify a transport error that only carries a display string.
    ///
    /// async-nats folds the API error code into the rendered message, so the
    /// code is recovered by looking for it in the text.
    pub fn classify(error: impl fmt::Display) -> Self {
        let message = error.to_string();
        let lower = message.to_lowercase();

        if let Some(code) = codes::CAPABILITY
            .iter()
            .find(|code| message.contains(&code.to_string()))
        {
            return Self::Capability {
                code: *code,
                message,
            };
        }
        if lower.contains("workqueue") || lower.contains("work queue") {
            return Self::Capability {
                code: codes::WORKQUEUE_NOT_UNIQUE,
                message,
            };
        }
        if message.contains(&codes::STREAM_NOT_FOUND.to_string())
            || message.contains(&codes::CONSUMER_NOT_FOUND.to_string())
            || lower.contains("not found")
        {
            return Self::NotFound(message);
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return Self::Timeout(message);
        }
        if lower.contains("no responders") {
            return Self::NoStream(message);
        }
        Self::Request(message)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability { .. })
    }
}

/// Errors surfaced by the work-queue components.
#[derive(Debug, Error)]
pub enum WorkQueueError {
    /// The transport could not be established.
    #[error("failed to connect to {address} after {attempts} attempt(s): {message}")]
    Connection {
        address: String,
        attempts: u32,
        message: String,
    },

    /// Stream or consumer create-or-get failed.
    #[error("{operation} failed: {source}")]
    Provisioning {
        operation: String,
        #[source]
        source: BrokerError,
    },

    /// The broker rejected the topology (overlapping consumer interest and similar).
    #[error("{operation} rejected by broker: {source}")]
    Capability {
        operation: String,
        #[source]
        source: BrokerError,
    },

    #[error("publish to '{subject}' failed: {source}")]
    Publish {
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error("fetch from consumer '{consumer}' failed: {source}")]
    Fetch {
        consumer: String,
        #[source]
        source: BrokerError,
    },

    /// A confirmed acknowledgement was not observed by the broker.
    #[error("acknowledgement of sequence {sequence} failed: {source}")]
    Ack {
        sequence: u64,
        #[source]
        source: BrokerError,
    },

    /// Payload is not a valid work item. Absorbed by the consumer loop.
    #[error("failed to decode work item: {0}")]
    Decode(#[source] serde_json::Error),

    /// Flushing outbound traffic on close failed.
    #[error("failed to drain connection: {0}")]
    Drain(String),

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u128 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkQueueError {
    /// Wrap a broker error raised while provisioning, keeping capability
    /// rejections distinguishable from other failures.
    pub fn provisioning(operation: impl Into<String>, source: BrokerError) -> Self {
        let operation = operation.into();
        if source.is_capability() {
            Self::Capability { operation, source }
        } else {
            Self::Provisioning { operation, source }
        }
    }

    /// Whether the error should terminate the running loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }

    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability { .. })
    }
}

/// Error categories determine how a failed delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure: negative-ack with backoff, the broker redelivers.
    Transient,
    /// Unrecoverable: terminate the delivery, never redelivered.
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error returned by a [`Processor`](crate::Processor).
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_api_not_found() {
        let err = BrokerError::from_api(codes::STREAM_NOT_FOUND, "stream not found");
        assert!(err.is_not_found());

        let err = BrokerError::from_api(codes::CONSUMER_NOT_FOUND, "consumer not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_api_capability() {
        let err = BrokerError::from_api(
            codes::WORKQUEUE_MULTIPLE_UNFILTERED,
            "multiple non-filtered consumers not allowed on workqueue stream",
        );
        assert_eq!(
            err,
            BrokerError::Capability {
                code: 10099,
                message: "multiple non-filtered consumers not allowed on workqueue stream"
                    .to_string()
            }
        );
    }

    #[test]
    fn test_from_api_other() {
        let err = BrokerError::from_api(10071, "wrong last sequence");
        assert!(matches!(err, BrokerError::Request(ref msg) if msg.contains("10071")));
    }

    #[test]
    fn test_classify_display_strings() {
        let err = BrokerError::classify(
            "JetStream error: filtered consumer not unique on workqueue stream (code 400, error code 10100)",
        );
        assert!(err.is_capability());

        let err = BrokerError::classify("stream not found (error code 10059)");
        assert!(err.is_not_found());

        let err = BrokerError::classify("request timed out");
        assert!(matches!(err, BrokerError::Timeout(_)));

        let err = BrokerError::classify("connection reset");
        assert!(matches!(err, BrokerError::Request(_)));
    }

    #[test]
    fn test_provisioning_keeps_capability_distinct() {
        let err = WorkQueueError::provisioning(
            "create consumer",
            BrokerError::from_api(codes::WORKQUEUE_NOT_UNIQUE, "not unique"),
        );
        assert!(err.is_capability());
        assert!(err.is_fatal());

        let err = WorkQueueError::provisioning("stream lookup", BrokerError::Timeout("5s".into()));
        assert!(matches!(err, WorkQueueError::Provisioning { .. }));
        assert!(err.to_string().contains("stream lookup"));
    }

    #[test]
    fn test_only_decode_is_absorbed() {
        let decode = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(!WorkQueueError::Decode(decode).is_fatal());
        assert!(WorkQueueError::Config("bad".into()).is_fatal());
        assert!(WorkQueueError::Publish {
            subject: "submit-tx".into(),
            source: BrokerError::NoStream("submit-tx".into()),
        }
        .is_fatal());
    }

    #[test]
    fn test_processing_error_category() {
        assert_eq!(
            ProcessingError::transient("retry me").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ProcessingError::permanent("drop me").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }
}
