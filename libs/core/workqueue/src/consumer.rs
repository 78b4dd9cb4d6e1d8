//! Consumer loop: fetch a batch on every tick, process and settle each
//! delivery in order.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{with_timeout, AckKind, Delivery};
use crate::config::{AckMode, ConsumerLoopConfig, DecodeFailurePolicy};
use crate::connection::ConnectionEvent;
use crate::dlq::DeadLetterPublisher;
use crate::error::{ErrorCategory, ProcessingError, WorkQueueError};
use crate::item::WorkItem;
use crate::metrics::WorkQueueMetrics;
use crate::processor::Processor;
use crate::provision::{ConsumerHandle, StreamHandle};
use crate::schedule::{is_shutdown, next_tick, Tick};

/// Totals reported when the consumer loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumerSummary {
    pub fetched: u64,
    /// Deliveries processed successfully and acknowledged
    pub acked: u64,
    pub decode_failures: u64,
    pub dead_lettered: u64,
    /// Negative acknowledgements, including the remainder of a cancelled batch
    pub nacked: u64,
    pub terminated: u64,
}

/// Pulls batches from a durable consumer until shutdown.
pub struct ConsumerLoop {
    consumer: ConsumerHandle,
    stream: StreamHandle,
    processor: Arc<dyn Processor>,
    config: ConsumerLoopConfig,
    timeout: Duration,
    dead_letter: Option<DeadLetterPublisher>,
    events: Option<broadcast::Receiver<ConnectionEvent>>,
    metrics: WorkQueueMetrics,
}

impl ConsumerLoop {
    pub fn new(
        consumer: ConsumerHandle,
        stream: StreamHandle,
        processor: Arc<dyn Processor>,
        config: ConsumerLoopConfig,
        timeout: Duration,
    ) -> Self {
        let metrics = WorkQueueMetrics::new(stream.name());
        Self {
            consumer,
            stream,
            processor,
            config,
            timeout,
            dead_letter: None,
            events: None,
            metrics,
        }
    }

    /// Log connection events between ticks.
    pub fn with_events(mut self, events: broadcast::Receiver<ConnectionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Dead-letter target for undecodable payloads (with
    /// [`DecodeFailurePolicy::DeadLetter`]) and permanent processing failures.
    pub fn with_dead_letter(mut self, publisher: DeadLetterPublisher) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    /// Run until `shutdown` turns true.
    ///
    /// Shutdown is observed between ticks and between deliveries. Deliveries
    /// of the current batch not yet handed to the processor are negatively
    /// acknowledged so they are redelivered right away.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerSummary, WorkQueueError> {
        if matches!(self.config.decode_failure, DecodeFailurePolicy::DeadLetter)
            && self.dead_letter.is_none()
        {
            return Err(WorkQueueError::Config(
                "dead-letter decode policy needs a dead-letter publisher".to_string(),
            ));
        }

        let mut summary = ConsumerSummary::default();
        info!(
            stream = %self.stream.name(),
            consumer = %self.consumer.name(),
            filter = ?self.consumer.filter_subject(),
            processor = self.processor.name(),
            batch_size = self.config.batch_size,
            ack_mode = %self.config.ack_mode,
            decode_failure = %self.config.decode_failure,
            "Starting consumer"
        );

        loop {
            let delay = self.config.interval.next_delay();
            if next_tick(delay, &mut shutdown, &mut self.events).await == Tick::Stop {
                break;
            }

            match self.process_batch(&shutdown, &mut summary).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(
                        consumer = %self.consumer.name(),
                        error = %e,
                        "Consumer failed, stopping"
                    );
                    return Err(e);
                }
            }
        }

        info!(
            fetched = summary.fetched,
            acked = summary.acked,
            decode_failures = summary.decode_failures,
            dead_lettered = summary.dead_lettered,
            nacked = summary.nacked,
            terminated = summary.terminated,
            "Consumer stopped"
        );
        Ok(summary)
    }

    /// Fetch and handle one batch. Returns `false` when shutdown interrupted it.
    async fn process_batch(
        &self,
        shutdown: &watch::Receiver<bool>,
        summary: &mut ConsumerSummary,
    ) -> Result<bool, WorkQueueError> {
        let batch = self
            .consumer
            .fetch(self.config.batch_size, self.config.fetch_mode)
            .await?;

        if batch.is_empty() {
            debug!(consumer = %self.consumer.name(), "No pending messages");
            return Ok(true);
        }

        let consumer = self.consumer.name();
        summary.fetched += batch.len() as u64;
        self.metrics.items_fetched(consumer, batch.len());
        info!(consumer = %consumer, count = batch.len(), "Fetched batch");

        let mut deliveries = batch.into_iter();
        while let Some(delivery) = deliveries.next() {
            if is_shutdown(shutdown) {
                let remaining = std::iter::once(delivery).chain(deliveries);
                self.release(remaining, summary).await;
                return Ok(false);
            }
            self.handle(delivery, summary).await?;
        }

        self.stream.report_occupancy(&self.metrics).await;
        Ok(true)
    }

    async fn handle(
        &self,
        delivery: Delivery,
        summary: &mut ConsumerSummary,
    ) -> Result<(), WorkQueueError> {
        let item = match WorkItem::decode(&delivery.payload) {
            Ok(item) => item,
            Err(e) => return self.handle_decode_failure(delivery, e, summary).await,
        };

        if delivery.is_redelivery() {
            debug!(
                id = %item.id,
                sequence = delivery.sequence,
                delivered = delivery.delivered,
                "Processing redelivered item"
            );
        }

        let start = Instant::now();
        let result = self.processor.process(&item, &delivery).await;
        let duration = start.elapsed();

        match result {
            Ok(()) => {
                let sequence = delivery.sequence;
                self.settle(delivery, self.ack_kind()).await?;
                summary.acked += 1;
                self.metrics.item_acked(self.consumer.name());
                debug!(
                    id = %item.id,
                    sequence,
                    duration_ms = duration.as_millis() as u64,
                    "Item processed"
                );
                Ok(())
            }
            Err(e) => self.handle_processing_error(delivery, e, summary).await,
        }
    }

    async fn handle_processing_error(
        &self,
        delivery: Delivery,
        error: ProcessingError,
        summary: &mut ConsumerSummary,
    ) -> Result<(), WorkQueueError> {
        match error.category() {
            ErrorCategory::Transient => {
                let delay = self
                    .config
                    .nak_backoff
                    .delay(u32::try_from(delivery.delivered.saturating_sub(1)).unwrap_or(u32::MAX));
                warn!(
                    sequence = delivery.sequence,
                    delivered = delivery.delivered,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient error, will retry"
                );
                self.settle(delivery, AckKind::Nak(Some(delay))).await?;
                summary.nacked += 1;
                self.metrics.item_nacked(self.consumer.name(), "nak");
            }
            ErrorCategory::Permanent => {
                warn!(
                    sequence = delivery.sequence,
                    delivered = delivery.delivered,
                    error = %error,
                    "Permanent error, terminating delivery"
                );
                if let Some(dead_letter) = &self.dead_letter {
                    self.publish_dead_letter(dead_letter, &delivery, &error.to_string(), summary)
                        .await?;
                }
                self.settle(delivery, AckKind::Term).await?;
                summary.terminated += 1;
                self.metrics.item_nacked(self.consumer.name(), "term");
            }
        }
        Ok(())
    }

    async fn handle_decode_failure(
        &self,
        delivery: Delivery,
        error: WorkQueueError,
        summary: &mut ConsumerSummary,
    ) -> Result<(), WorkQueueError> {
        summary.decode_failures += 1;
        self.metrics.decode_failed(self.consumer.name());
        warn!(
            subject = %delivery.subject,
            sequence = delivery.sequence,
            policy = %self.config.decode_failure,
            error = %error,
            "Failed to decode work item"
        );

        match self.config.decode_failure {
            DecodeFailurePolicy::Acknowledge => self.settle(delivery, self.ack_kind()).await,
            DecodeFailurePolicy::Terminate => {
                self.settle(delivery, AckKind::Term).await?;
                summary.terminated += 1;
                self.metrics.item_nacked(self.consumer.name(), "term");
                Ok(())
            }
            DecodeFailurePolicy::DeadLetter => {
                let Some(dead_letter) = &self.dead_letter else {
                    return Err(WorkQueueError::Config(
                        "dead-letter decode policy needs a dead-letter publisher".to_string(),
                    ));
                };
                self.publish_dead_letter(dead_letter, &delivery, &error.to_string(), summary)
                    .await?;
                self.settle(delivery, self.ack_kind()).await
            }
        }
    }

    /// Publish a dead-letter entry. On failure the delivery is released for
    /// redelivery and the publish error returned.
    async fn publish_dead_letter(
        &self,
        dead_letter: &DeadLetterPublisher,
        delivery: &Delivery,
        error: &str,
        summary: &mut ConsumerSummary,
    ) -> Result<(), WorkQueueError> {
        match dead_letter.publish(delivery, error).await {
            Ok(_) => {
                summary.dead_lettered += 1;
                self.metrics.item_dead_lettered(self.consumer.name());
                Ok(())
            }
            Err(e) => {
                error!(
                    subject = %dead_letter.subject(),
                    sequence = delivery.sequence,
                    error = %e,
                    "Dead-letter publish failed"
                );
                Err(e)
            }
        }
    }

    /// Negatively acknowledge deliveries that will not be processed.
    async fn release(
        &self,
        deliveries: impl Iterator<Item = Delivery>,
        summary: &mut ConsumerSummary,
    ) {
        let mut released = 0u64;
        for delivery in deliveries {
            if self.settle(delivery, AckKind::Nak(None)).await.is_ok() {
                released += 1;
            }
        }
        summary.nacked += released;
        info!(released, "Shutdown requested, released unprocessed deliveries");
    }

    fn ack_kind(&self) -> AckKind {
        match self.config.ack_mode {
            AckMode::FireAndForget => AckKind::Ack,
            AckMode::Confirmed => AckKind::AckConfirmed,
        }
    }

    /// Settle a delivery. Only a failed confirmed ack is an error; other
    /// settlement failures leave redelivery to the ack-wait timeout.
    async fn settle(&self, delivery: Delivery, kind: AckKind) -> Result<(), WorkQueueError> {
        let sequence = delivery.sequence;
        match with_timeout(self.timeout, "ack", delivery.ack(kind)).await {
            Ok(()) => Ok(()),
            Err(source) if kind == AckKind::AckConfirmed => {
                Err(WorkQueueError::Ack { sequence, source })
            }
            Err(e) => {
                warn!(sequence, kind = %kind, error = %e, "Failed to settle delivery");
                Ok(())
            }
        }
    }
}
