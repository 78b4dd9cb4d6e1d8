//! Producer loop: publish a timestamped work item on every tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::broker::{with_timeout, Publish};
use crate::config::ProducerConfig;
use crate::connection::ConnectionEvent;
use crate::error::WorkQueueError;
use crate::item::WorkItem;
use crate::metrics::WorkQueueMetrics;
use crate::provision::StreamHandle;
use crate::schedule::{next_tick, Tick};
use crate::subject;

/// Totals reported when the producer loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerSummary {
    pub published: u64,
}

/// Publishes one [`WorkItem`] per jittered tick until shutdown.
pub struct ProducerLoop {
    publisher: Arc<dyn Publish>,
    stream: StreamHandle,
    config: ProducerConfig,
    timeout: Duration,
    events: Option<broadcast::Receiver<ConnectionEvent>>,
    metrics: WorkQueueMetrics,
}

impl ProducerLoop {
    /// Fails with a configuration error when the subject is not a literal
    /// subject captured by `stream`.
    pub fn new(
        publisher: Arc<dyn Publish>,
        stream: StreamHandle,
        config: ProducerConfig,
        timeout: Duration,
    ) -> Result<Self, WorkQueueError> {
        if !subject::is_valid(&config.subject, false) {
            return Err(WorkQueueError::Config(format!(
                "publish subject '{}' must be a literal subject",
                config.subject
            )));
        }
        if !stream
            .subjects()
            .iter()
            .any(|pattern| subject::matches(pattern, &config.subject))
        {
            return Err(WorkQueueError::Config(format!(
                "stream '{}' does not capture subject '{}'",
                stream.name(),
                config.subject
            )));
        }

        let metrics = WorkQueueMetrics::new(stream.name());
        Ok(Self {
            publisher,
            stream,
            config,
            timeout,
            events: None,
            metrics,
        })
    }

    /// Log connection events between ticks.
    pub fn with_events(mut self, events: broadcast::Receiver<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run until `shutdown` turns true. A publish failure ends the loop.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ProducerSummary, WorkQueueError> {
        let mut summary = ProducerSummary::default();
        info!(
            stream = %self.stream.name(),
            subject = %self.config.subject,
            interval_ms = self.config.interval.base().as_millis() as u64,
            "Starting producer"
        );

        loop {
            let delay = self.config.interval.next_delay();
            if next_tick(delay, &mut shutdown, &mut self.events).await == Tick::Stop {
                break;
            }

            if let Err(e) = self.publish_one().await {
                error!(
                    subject = %self.config.subject,
                    published = summary.published,
                    error = %e,
                    "Publish failed, stopping producer"
                );
                return Err(e);
            }
            summary.published += 1;
            self.stream.report_occupancy(&self.metrics).await;
        }

        info!(published = summary.published, "Producer stopped");
        Ok(summary)
    }

    async fn publish_one(&self) -> Result<(), WorkQueueError> {
        let item = WorkItem::timestamped();
        let payload = item.encode()?;
        let subject = self.config.subject.as_str();

        let ack = with_timeout(self.timeout, "publish", self.publisher.publish(subject, payload))
            .await
            .map_err(|source| WorkQueueError::Publish {
                subject: subject.to_string(),
                source,
            })?;

        self.metrics.item_published();
        info!(
            id = %item.id,
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Published work item"
        );
        if ack.duplicate {
            debug!(sequence = ack.sequence, "Broker reported a duplicate publish");
        }
        Ok(())
    }
}
