//! Idempotent stream and consumer provisioning.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::broker::{
    with_timeout, Broker, ConsumerApi, ConsumerState, Delivery, StreamApi, StreamState,
};
use crate::config::FetchMode;
use crate::descriptor::{ConsumerDescriptor, StreamDescriptor};
use crate::error::{codes, BrokerError, WorkQueueError};
use crate::metrics::WorkQueueMetrics;

/// Handle on a provisioned stream.
#[derive(Clone)]
pub struct StreamHandle {
    api: Arc<dyn StreamApi>,
    created: bool,
    timeout: Duration,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("name", &self.api.name())
            .field("subjects", &self.api.subjects())
            .field("created", &self.created)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StreamHandle {
    pub fn name(&self) -> &str {
        self.api.name()
    }

    pub fn subjects(&self) -> &[String] {
        self.api.subjects()
    }

    /// Whether this call created the stream, as opposed to finding it.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn api(&self) -> Arc<dyn StreamApi> {
        self.api.clone()
    }

    pub async fn info(&self) -> Result<StreamState, WorkQueueError> {
        with_timeout(self.timeout, "stream info", self.api.info())
            .await
            .map_err(|source| WorkQueueError::Provisioning {
                operation: format!("stream info '{}'", self.name()),
                source,
            })
    }

    /// Log the current occupancy of the stream.
    ///
    /// Occupancy is observability only, so failures are logged and `None`
    /// is returned.
    pub async fn report_occupancy(&self, metrics: &WorkQueueMetrics) -> Option<StreamState> {
        match self.info().await {
            Ok(state) => {
                metrics.stream_depth(state.messages);
                info!(
                    stream = %self.name(),
                    messages = state.messages,
                    bytes = state.bytes,
                    subjects = state.subjects,
                    consumers = state.consumers,
                    last_sequence = state.last_sequence,
                    "Stream occupancy"
                );
                Some(state)
            }
            Err(e) => {
                warn!(stream = %self.name(), error = %e, "Failed to read stream occupancy");
                None
            }
        }
    }
}

/// Handle on a provisioned durable consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    stream: String,
    api: Arc<dyn ConsumerApi>,
    created: bool,
    timeout: Duration,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("stream", &self.stream)
            .field("name", &self.api.name())
            .field("created", &self.created)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        self.api.name()
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn filter_subject(&self) -> Option<&str> {
        self.api.filter_subject()
    }

    pub fn was_created(&self) -> bool {
        self.created
    }

    /// Pull up to `max` messages. A waiting fetch gets its wait added to
    /// the operation bound.
    pub async fn fetch(&self, max: usize, mode: FetchMode) -> Result<Vec<Delivery>, WorkQueueError> {
        let bound = match mode {
            FetchMode::NoWait => self.timeout,
            FetchMode::Wait(wait) => self.timeout + wait,
        };
        with_timeout(bound, "fetch", self.api.fetch(max, mode))
            .await
            .map_err(|source| WorkQueueError::Fetch {
                consumer: self.name().to_string(),
                source,
            })
    }

    pub async fn info(&self) -> Result<ConsumerState, WorkQueueError> {
        with_timeout(self.timeout, "consumer info", self.api.info())
            .await
            .map_err(|source| WorkQueueError::Fetch {
                consumer: self.name().to_string(),
                source,
            })
    }
}

/// Creates streams and consumers on first use and reuses them afterwards.
///
/// Existing resources are returned as they are: a descriptor that differs
/// from the live configuration is not reconciled.
#[derive(Clone)]
pub struct Provisioner {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl Provisioner {
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    #[instrument(skip(self, descriptor), fields(stream = %descriptor.name))]
    pub async fn ensure_stream(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<StreamHandle, WorkQueueError> {
        descriptor.validate()?;

        if let Some(api) = self.lookup_stream(&descriptor.name).await? {
            info!(subjects = ?api.subjects(), "Using existing stream");
            return Ok(self.stream_handle(api, false));
        }

        info!(
            subjects = ?descriptor.subjects,
            retention = ?descriptor.retention,
            storage = ?descriptor.storage,
            "Creating stream"
        );
        let created = with_timeout(
            self.timeout,
            "create stream",
            self.broker.create_stream(descriptor),
        )
        .await;

        match created {
            Ok(api) => {
                info!("Stream created");
                Ok(self.stream_handle(api, true))
            }
            // Another process created it between the lookup and the create.
            Err(BrokerError::Capability { code, .. }) if code == codes::STREAM_NAME_IN_USE => {
                match self.lookup_stream(&descriptor.name).await? {
                    Some(api) => {
                        debug!("Stream appeared concurrently, using it");
                        Ok(self.stream_handle(api, false))
                    }
                    None => Err(WorkQueueError::provisioning(
                        format!("create stream '{}'", descriptor.name),
                        BrokerError::from_api(code, "stream name already in use"),
                    )),
                }
            }
            Err(source) => Err(WorkQueueError::provisioning(
                format!("create stream '{}'", descriptor.name),
                source,
            )),
        }
    }

    #[instrument(
        skip(self, stream, descriptor),
        fields(stream = %stream.name(), consumer = %descriptor.name)
    )]
    pub async fn ensure_consumer(
        &self,
        stream: &StreamHandle,
        descriptor: &ConsumerDescriptor,
    ) -> Result<ConsumerHandle, WorkQueueError> {
        descriptor.validate(stream.subjects())?;

        if let Some(api) = self.lookup_consumer(stream, &descriptor.name).await? {
            info!(filter = ?api.filter_subject(), "Using existing consumer");
            return Ok(self.consumer_handle(stream, api, false));
        }

        info!(
            filter = ?descriptor.filter_subject,
            ack_wait_secs = descriptor.ack_wait.as_secs(),
            max_deliver = descriptor.max_deliver,
            "Creating consumer"
        );
        let created = with_timeout(
            self.timeout,
            "create consumer",
            stream.api.create_consumer(descriptor),
        )
        .await;

        match created {
            Ok(api) => {
                info!("Consumer created");
                Ok(self.consumer_handle(stream, api, true))
            }
            Err(BrokerError::Capability { code, .. })
                if code == codes::CONSUMER_ALREADY_EXISTS =>
            {
                match self.lookup_consumer(stream, &descriptor.name).await? {
                    Some(api) => Ok(self.consumer_handle(stream, api, false)),
                    None => Err(WorkQueueError::provisioning(
                        format!("create consumer '{}'", descriptor.name),
                        BrokerError::from_api(code, "consumer already exists"),
                    )),
                }
            }
            Err(source) => {
                let error = WorkQueueError::provisioning(
                    format!("create consumer '{}'", descriptor.name),
                    source,
                );
                if error.is_capability() {
                    warn!(error = %error, "Consumer interest overlaps an existing consumer");
                }
                Err(error)
            }
        }
    }

    /// Remove a consumer, releasing its subject interest. Returns whether
    /// it existed.
    #[instrument(skip(self, stream), fields(stream = %stream.name()))]
    pub async fn delete_consumer(
        &self,
        stream: &StreamHandle,
        name: &str,
    ) -> Result<bool, WorkQueueError> {
        let deleted = with_timeout(
            self.timeout,
            "delete consumer",
            stream.api.delete_consumer(name),
        )
        .await
        .map_err(|source| {
            WorkQueueError::provisioning(format!("delete consumer '{name}'"), source)
        })?;

        if deleted {
            info!(consumer = %name, "Consumer deleted");
        } else {
            debug!(consumer = %name, "Consumer did not exist");
        }
        Ok(deleted)
    }

    async fn lookup_stream(&self, name: &str) -> Result<Option<Arc<dyn StreamApi>>, WorkQueueError> {
        with_timeout(self.timeout, "stream lookup", self.broker.lookup_stream(name))
            .await
            .map_err(|source| WorkQueueError::provisioning(format!("lookup stream '{name}'"), source))
    }

    async fn lookup_consumer(
        &self,
        stream: &StreamHandle,
        name: &str,
    ) -> Result<Option<Arc<dyn ConsumerApi>>, WorkQueueError> {
        with_timeout(
            self.timeout,
            "consumer lookup",
            stream.api.lookup_consumer(name),
        )
        .await
        .map_err(|source| WorkQueueError::provisioning(format!("lookup consumer '{name}'"), source))
    }

    fn stream_handle(&self, api: Arc<dyn StreamApi>, created: bool) -> StreamHandle {
        StreamHandle {
            api,
            created,
            timeout: self.timeout,
        }
    }

    fn consumer_handle(
        &self,
        stream: &StreamHandle,
        api: Arc<dyn ConsumerApi>,
        created: bool,
    ) -> ConsumerHandle {
        ConsumerHandle {
            stream: stream.name().to_string(),
            api,
            created,
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Publish;
    use crate::descriptor::{EventsQueue, SubmitTxQueue};
    use async_trait::async_trait;

    fn provisioner(broker: &MemoryBroker) -> Provisioner {
        Provisioner::new(Arc::new(broker.clone()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        let descriptor = StreamDescriptor::from_def::<SubmitTxQueue>();

        let first = provisioner.ensure_stream(&descriptor).await.unwrap();
        assert!(first.was_created());

        broker.publish("submit-tx", b"{}".to_vec()).await.unwrap();

        let second = provisioner.ensure_stream(&descriptor).await.unwrap();
        assert!(!second.was_created());
        assert_eq!(second.name(), "stream-1");
        assert_eq!(second.info().await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_existing_stream_is_not_reconciled() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        provisioner
            .ensure_stream(&StreamDescriptor::new("EVENTS", ["events.>"]))
            .await
            .unwrap();

        let changed = StreamDescriptor::new("EVENTS", ["events.>"])
            .with_max_age(Duration::from_secs(5));
        let handle = provisioner.ensure_stream(&changed).await.unwrap();
        assert!(!handle.was_created());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_never_reaches_broker() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);

        let err = provisioner
            .ensure_stream(&StreamDescriptor::new("bad.name", ["events.>"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkQueueError::Config(_)));
        assert!(broker.lookup_stream("bad.name").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_consumer_is_capability_error() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        let stream = provisioner
            .ensure_stream(&StreamDescriptor::from_def::<EventsQueue>())
            .await
            .unwrap();

        let first = provisioner
            .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-1"))
            .await
            .unwrap();
        assert!(first.was_created());

        let again = provisioner
            .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-1"))
            .await
            .unwrap();
        assert!(!again.was_created());

        let err = provisioner
            .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-2"))
            .await
            .unwrap_err();
        assert!(err.is_capability(), "unexpected error: {err}");

        assert!(provisioner.delete_consumer(&stream, "processor-1").await.unwrap());
        assert!(!provisioner.delete_consumer(&stream, "processor-1").await.unwrap());
        provisioner
            .ensure_consumer(&stream, &ConsumerDescriptor::new("processor-2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_filter_outside_stream_is_config_error() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        let stream = provisioner
            .ensure_stream(&StreamDescriptor::from_def::<EventsQueue>())
            .await
            .unwrap();

        let err = provisioner
            .ensure_consumer(
                &stream,
                &ConsumerDescriptor::new("orders").with_filter("orders.>"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkQueueError::Config(_)));
    }

    struct FailingBroker;

    #[async_trait]
    impl Broker for FailingBroker {
        async fn lookup_stream(
            &self,
            _name: &str,
        ) -> Result<Option<Arc<dyn StreamApi>>, BrokerError> {
            Err(BrokerError::Request("connection reset".into()))
        }

        async fn create_stream(
            &self,
            _descriptor: &StreamDescriptor,
        ) -> Result<Arc<dyn StreamApi>, BrokerError> {
            panic!("create must not be attempted after a failed lookup");
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let provisioner = Provisioner::new(Arc::new(FailingBroker), Duration::from_secs(1));
        let err = provisioner
            .ensure_stream(&StreamDescriptor::from_def::<EventsQueue>())
            .await
            .unwrap_err();

        match err {
            WorkQueueError::Provisioning { operation, source } => {
                assert!(operation.contains("EVENTS"));
                assert_eq!(source, BrokerError::Request("connection reset".into()));
            }
            other => panic!("expected provisioning error, got {other}"),
        }
    }
}
