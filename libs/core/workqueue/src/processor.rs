//! Processor trait for work item handling.

use async_trait::async_trait;
use tracing::info;

use crate::broker::Delivery;
use crate::error::ProcessingError;
use crate::item::WorkItem;

/// Work item processor.
///
/// The consumer loop calls `process` for every decoded item and settles the
/// delivery from the result:
/// - `Ok(())`: acknowledged
/// - `Transient`: negatively acknowledged with backoff, redelivered later
/// - `Permanent`: terminated, never redelivered
///
/// # Example
///
/// ```rust,ignore
/// use workqueue::{Delivery, ProcessingError, Processor, WorkItem};
/// use async_trait::async_trait;
///
/// struct LedgerProcessor {
///     ledger: Arc<Ledger>,
/// }
///
/// #[async_trait]
/// impl Processor for LedgerProcessor {
///     async fn process(&self, item: &WorkItem, _delivery: &Delivery) -> Result<(), ProcessingError> {
///         self.ledger.apply(&item.payload).await.map_err(|e| {
///             if e.is_retryable() {
///                 ProcessingError::transient_with_source("ledger unavailable", e)
///             } else {
///                 ProcessingError::permanent_with_source("invalid transaction", e)
///             }
///         })
///     }
///
///     fn name(&self) -> &'static str {
///         "ledger_processor"
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one item. `delivery` carries the subject, stream sequence and
    /// delivery attempt.
    async fn process(&self, item: &WorkItem, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// Used for logging and metrics labels.
    fn name(&self) -> &'static str;
}

/// Logs every item it receives.
#[derive(Debug, Clone, Default)]
pub struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, item: &WorkItem, delivery: &Delivery) -> Result<(), ProcessingError> {
        info!(
            id = %item.id,
            created_at = %item.created_at.to_rfc3339(),
            payload = %item.payload,
            subject = %delivery.subject,
            sequence = delivery.sequence,
            delivered = delivery.delivered,
            "Received work item"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging_processor"
    }
}

/// A no-op processor for testing.
#[derive(Debug, Clone, Default)]
pub struct NoOpProcessor;

#[async_trait]
impl Processor for NoOpProcessor {
    async fn process(&self, _item: &WorkItem, _delivery: &Delivery) -> Result<(), ProcessingError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop_processor"
    }
}

/// A processor that always fails (for testing).
#[derive(Debug, Clone)]
pub struct FailingProcessor {
    error_message: String,
    transient: bool,
}

impl FailingProcessor {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            transient: false,
        }
    }
}

#[async_trait]
impl Processor for FailingProcessor {
    async fn process(&self, _item: &WorkItem, _delivery: &Delivery) -> Result<(), ProcessingError> {
        if self.transient {
            Err(ProcessingError::transient(&self.error_message))
        } else {
            Err(ProcessingError::permanent(&self.error_message))
        }
    }

    fn name(&self) -> &'static str {
        "failing_processor"
    }
}
