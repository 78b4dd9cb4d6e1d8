//! JetStream implementation of the broker capability traits.

use async_nats::jetstream::consumer::{pull, AckPolicy as NatsAckPolicy, Consumer};
use async_nats::jetstream::{self, stream};
use async_nats::Client;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{
    AckKind, Acknowledge, Broker, ConsumerApi, ConsumerState, Delivery, Publish, PublishAck,
    StreamApi, StreamState,
};
use crate::config::FetchMode;
use crate::descriptor::{
    AckPolicy, ConsumerDescriptor, DiscardPolicy, RetentionPolicy, StorageClass, StreamDescriptor,
};
use crate::error::BrokerError;

/// Run a transport call with a deadline, classifying its error.
async fn bounded<T, E, F>(timeout: Duration, operation: &str, future: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BrokerError::classify(e)),
        Err(_) => Err(BrokerError::Timeout(format!(
            "{operation} after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiError {
    code: u16,
    err_code: u64,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(default)]
    error: Option<ApiError>,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStreamInfo {
    config: RawStreamConfig,
    state: RawStreamState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStreamConfig {
    subjects: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStreamState {
    messages: u64,
    bytes: u64,
    first_seq: u64,
    last_seq: u64,
    num_subjects: u64,
    consumer_count: usize,
}

impl From<RawStreamState> for StreamState {
    fn from(raw: RawStreamState) -> Self {
        StreamState {
            messages: raw.messages,
            bytes: raw.bytes,
            subjects: raw.num_subjects,
            consumers: raw.consumer_count,
            first_sequence: raw.first_seq,
            last_sequence: raw.last_seq,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConsumerInfo {
    config: RawConsumerConfig,
    num_pending: u64,
    num_ack_pending: u64,
    num_redelivered: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConsumerConfig {
    filter_subject: Option<String>,
}

fn stream_config(descriptor: &StreamDescriptor) -> stream::Config {
    stream::Config {
        name: descriptor.name.clone(),
        description: descriptor.description.clone(),
        subjects: descriptor.subjects.clone(),
        retention: match descriptor.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        storage: match descriptor.storage {
            StorageClass::Memory => stream::StorageType::Memory,
            StorageClass::File => stream::StorageType::File,
        },
        max_age: descriptor.max_age,
        max_bytes: descriptor.max_bytes,
        max_messages: descriptor.max_messages,
        discard: match descriptor.discard {
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
            DiscardPolicy::New => stream::DiscardPolicy::New,
        },
        num_replicas: descriptor.replicas,
        ..Default::default()
    }
}

fn consumer_config(descriptor: &ConsumerDescriptor) -> pull::Config {
    pull::Config {
        durable_name: Some(descriptor.name.clone()),
        name: Some(descriptor.name.clone()),
        description: descriptor.description.clone(),
        ack_policy: match descriptor.ack_policy {
            AckPolicy::Explicit => NatsAckPolicy::Explicit,
            AckPolicy::None => NatsAckPolicy::None,
        },
        ack_wait: descriptor.ack_wait,
        max_deliver: descriptor.max_deliver,
        filter_subject: descriptor.filter_subject.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// JetStream backend over an async-nats client.
///
/// Cloning is cheap; all clones share the client.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    context: jetstream::Context,
    timeout: Duration,
}

impl JetStreamBroker {
    /// `timeout` bounds every request made through this broker.
    pub fn new(client: Client, timeout: Duration) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            context,
            timeout,
        }
    }

    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    /// Raw JetStream API request. `Ok(None)` when the API answers "not found".
    async fn api_request<T>(&self, subject: String) -> Result<Option<T>, BrokerError>
    where
        T: DeserializeOwned,
    {
        let response = bounded(
            self.timeout,
            &subject,
            self.client.request(subject.clone(), "".into()),
        )
        .await?;

        let parsed: ApiResponse<T> = serde_json::from_slice(&response.payload).map_err(|e| {
            BrokerError::Request(format!("invalid response to {subject}: {e}"))
        })?;

        match parsed.error {
            None => Ok(Some(parsed.body)),
            Some(error) => {
                debug!(
                    subject = %subject,
                    code = error.code,
                    err_code = error.err_code,
                    "JetStream API error"
                );
                match BrokerError::from_api(error.err_code, error.description) {
                    BrokerError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        }
    }

    async fn stream_info(&self, name: &str) -> Result<Option<RawStreamInfo>, BrokerError> {
        self.api_request(format!("$JS.API.STREAM.INFO.{name}")).await
    }

    async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> Result<Option<RawConsumerInfo>, BrokerError> {
        self.api_request(format!("$JS.API.CONSUMER.INFO.{stream}.{consumer}"))
            .await
    }

    fn stream_handle(&self, stream: stream::Stream, subjects: Vec<String>) -> Arc<dyn StreamApi> {
        Arc::new(NatsStream {
            broker: self.clone(),
            name: stream.cached_info().config.name.clone(),
            stream,
            subjects,
        })
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn lookup_stream(&self, name: &str) -> Result<Option<Arc<dyn StreamApi>>, BrokerError> {
        let Some(info) = self.stream_info(name).await? else {
            return Ok(None);
        };
        let stream = bounded(self.timeout, "get stream", self.context.get_stream(name)).await?;
        Ok(Some(self.stream_handle(stream, info.config.subjects)))
    }

    async fn create_stream(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Arc<dyn StreamApi>, BrokerError> {
        let stream = bounded(
            self.timeout,
            "create stream",
            self.context.create_stream(stream_config(descriptor)),
        )
        .await?;
        Ok(self.stream_handle(stream, descriptor.subjects.clone()))
    }
}

#[async_trait]
impl Publish for JetStreamBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError> {
        let ack = bounded(self.timeout, "publish", async {
            let pending = self
                .context
                .publish(subject.to_string(), payload.into())
                .await?;
            pending.await
        })
        .await?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}

struct NatsStream {
    broker: JetStreamBroker,
    stream: stream::Stream,
    name: String,
    subjects: Vec<String>,
}

impl NatsStream {
    fn consumer_handle(
        &self,
        consumer: Consumer<pull::Config>,
        filter: Option<String>,
    ) -> Arc<dyn ConsumerApi> {
        Arc::new(NatsConsumer {
            broker: self.broker.clone(),
            name: consumer.cached_info().name.clone(),
            stream: self.name.clone(),
            filter: filter.filter(|subject| !subject.is_empty()),
            consumer,
        })
    }
}

#[async_trait]
impl StreamApi for NatsStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn subjects(&self) -> &[String] {
        &self.subjects
    }

    async fn info(&self) -> Result<StreamState, BrokerError> {
        self.broker
            .stream_info(&self.name)
            .await?
            .map(|info| info.state.into())
            .ok_or_else(|| BrokerError::NotFound(format!("stream '{}'", self.name)))
    }

    async fn lookup_consumer(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn ConsumerApi>>, BrokerError> {
        let Some(info) = self.broker.consumer_info(&self.name, name).await? else {
            return Ok(None);
        };
        let consumer = bounded(
            self.broker.timeout,
            "get consumer",
            self.stream.get_consumer::<pull::Config>(name),
        )
        .await?;
        Ok(Some(self.consumer_handle(consumer, info.config.filter_subject)))
    }

    async fn create_consumer(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Arc<dyn ConsumerApi>, BrokerError> {
        let consumer = bounded(
            self.broker.timeout,
            "create consumer",
            self.stream.create_consumer(consumer_config(descriptor)),
        )
        .await?;
        Ok(self.consumer_handle(consumer, descriptor.filter_subject.clone()))
    }

    async fn delete_consumer(&self, name: &str) -> Result<bool, BrokerError> {
        match bounded(
            self.broker.timeout,
            "delete consumer",
            self.stream.delete_consumer(name),
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(BrokerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

struct NatsConsumer {
    broker: JetStreamBroker,
    consumer: Consumer<pull::Config>,
    stream: String,
    name: String,
    filter: Option<String>,
}

impl NatsConsumer {
    /// Drain a pull batch. `bound` caps the wait for each next message.
    async fn collect<S, E>(&self, messages: S, bound: Duration) -> Result<Vec<Delivery>, BrokerError>
    where
        S: Stream<Item = Result<jetstream::Message, E>>,
        E: fmt::Display,
    {
        let mut messages = std::pin::pin!(messages);
        let mut deliveries = Vec::new();

        loop {
            match tokio::time::timeout(bound, messages.next()).await {
                Ok(Some(Ok(message))) => deliveries.push(self.delivery(message)),
                Ok(Some(Err(e))) if deliveries.is_empty() => return Err(BrokerError::classify(e)),
                Ok(Some(Err(e))) => {
                    warn!(
                        consumer = %self.name,
                        received = deliveries.len(),
                        error = %e,
                        "Batch ended with an error, keeping received messages"
                    );
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        consumer = %self.name,
                        received = deliveries.len(),
                        "Batch did not complete in time"
                    );
                    break;
                }
            }
        }
        Ok(deliveries)
    }

    fn delivery(&self, message: jetstream::Message) -> Delivery {
        let (sequence, delivered) = match message.info() {
            Ok(info) => (
                info.stream_sequence,
                u64::try_from(info.delivered).unwrap_or(1).max(1),
            ),
            Err(e) => {
                warn!(error = %e, "Failed to read delivery metadata, using defaults");
                (0, 1)
            }
        };
        let subject = message.subject.to_string();
        let payload = message.payload.to_vec();

        Delivery::new(
            subject,
            payload,
            sequence,
            delivered,
            Box::new(NatsAck {
                message,
                timeout: self.broker.timeout,
            }),
        )
    }
}

#[async_trait]
impl ConsumerApi for NatsConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_subject(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    async fn fetch(&self, max: usize, mode: FetchMode) -> Result<Vec<Delivery>, BrokerError> {
        let timeout = self.broker.timeout;
        match mode {
            FetchMode::NoWait => {
                let batch = bounded(
                    timeout,
                    "fetch",
                    self.consumer.fetch().max_messages(max).messages(),
                )
                .await?;
                self.collect(batch, timeout).await
            }
            FetchMode::Wait(wait) => {
                let batch = bounded(
                    timeout,
                    "fetch",
                    self.consumer
                        .batch()
                        .max_messages(max)
                        .expires(wait)
                        .messages(),
                )
                .await?;
                self.collect(batch, timeout + wait).await
            }
        }
    }

    async fn info(&self) -> Result<ConsumerState, BrokerError> {
        let info = self
            .broker
            .consumer_info(&self.stream, &self.name)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("consumer '{}'", self.name)))?;

        Ok(ConsumerState {
            pending: info.num_pending,
            ack_pending: info.num_ack_pending,
            redelivered: info.num_redelivered,
        })
    }
}

struct NatsAck {
    message: jetstream::Message,
    timeout: Duration,
}

#[async_trait]
impl Acknowledge for NatsAck {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), BrokerError> {
        let message = &self.message;
        match kind {
            AckKind::Ack => bounded(self.timeout, "ack", message.ack()).await,
            AckKind::AckConfirmed => bounded(self.timeout, "double ack", message.double_ack()).await,
            AckKind::Nak(delay) => {
                bounded(
                    self.timeout,
                    "nak",
                    message.ack_with(jetstream::AckKind::Nak(delay)),
                )
                .await
            }
            AckKind::Term => {
                bounded(
                    self.timeout,
                    "term",
                    message.ack_with(jetstream::AckKind::Term),
                )
                .await
            }
        }
    }
}
