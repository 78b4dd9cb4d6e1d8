//! Prometheus metrics for the producer and consumer loops.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};

use crate::error::WorkQueueError;

/// Metrics labelled by stream.
#[derive(Debug, Clone)]
pub struct WorkQueueMetrics {
    stream_name: String,
}

impl WorkQueueMetrics {
    pub fn new(stream_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
        }
    }

    pub fn item_published(&self) {
        counter!(
            "workqueue_items_published_total",
            "stream" => self.stream_name.clone()
        )
        .increment(1);
    }

    pub fn items_fetched(&self, consumer: &str, count: usize) {
        counter!(
            "workqueue_items_fetched_total",
            "stream" => self.stream_name.clone(),
            "consumer" => consumer.to_string()
        )
        .increment(count as u64);
    }

    pub fn item_acked(&self, consumer: &str) {
        counter!(
            "workqueue_items_acked_total",
            "stream" => self.stream_name.clone(),
            "consumer" => consumer.to_string()
        )
        .increment(1);
    }

    /// Record a negative or terminal acknowledgement.
    pub fn item_nacked(&self, consumer: &str, kind: &'static str) {
        counter!(
            "workqueue_items_nacked_total",
            "stream" => self.stream_name.clone(),
            "consumer" => consumer.to_string(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn decode_failed(&self, consumer: &str) {
        counter!(
            "workqueue_decode_failures_total",
            "stream" => self.stream_name.clone(),
            "consumer" => consumer.to_string()
        )
        .increment(1);
    }

    pub fn item_dead_lettered(&self, consumer: &str) {
        counter!(
            "workqueue_items_dead_lettered_total",
            "stream" => self.stream_name.clone(),
            "consumer" => consumer.to_string()
        )
        .increment(1);
    }

    /// Update stream depth gauge.
    pub fn stream_depth(&self, depth: u64) {
        gauge!(
            "workqueue_stream_depth",
            "stream" => self.stream_name.clone()
        )
        .set(depth as f64);
    }
}

/// Count a connection lifecycle event.
pub fn record_connection_event(kind: &'static str) {
    counter!("workqueue_connection_events_total", "kind" => kind).increment(1);
}

/// Install the Prometheus recorder with an HTTP listener on `0.0.0.0:port`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(port: u16) -> Result<(), WorkQueueError> {
    let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| WorkQueueError::Config(format!("failed to install metrics exporter: {e}")))
}
