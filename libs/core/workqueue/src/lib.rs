//! Durable work-queue client over NATS JetStream.
//!
//! The crate provisions a subject-scoped work-queue stream, provisions
//! durable pull consumers over it, publishes timestamped work items and
//! consumes them with explicit, at-least-once acknowledgement.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ ManagedConnection │────▶│   Provisioner   │────▶│ ProducerLoop     │
//! │ (NATS or memory)  │     │ stream/consumer │     │   or             │
//! └───────────────────┘     └─────────────────┘     │ ConsumerLoop     │
//!           │                                       └──────────────────┘
//!           │        connection events (broadcast)           ▲
//!           └────────────────────────────────────────────────┘
//! ```
//!
//! Protocol logic only depends on the capability traits in [`broker`];
//! [`nats`] implements them over async-nats and [`broker::memory`] in
//! process.
//!
//! # Example
//!
//! ```rust,ignore
//! use workqueue::{
//!     ConnectionConfig, ConnectionManager, ConsumerDescriptor, ConsumerLoop,
//!     ConsumerLoopConfig, LoggingProcessor, ManagedConnection, Provisioner,
//!     StreamDescriptor, SubmitTxQueue,
//! };
//!
//! let connection = ConnectionManager::connect(ConnectionConfig::new("nats://127.0.0.1:4222")).await?;
//! let provisioner = Provisioner::new(connection.broker(), connection.operation_timeout());
//!
//! let stream = provisioner.ensure_stream(&StreamDescriptor::from_def::<SubmitTxQueue>()).await?;
//! let consumer = provisioner
//!     .ensure_consumer(&stream, &ConsumerDescriptor::from_def::<SubmitTxQueue>())
//!     .await?;
//!
//! let summary = ConsumerLoop::new(
//!     consumer,
//!     stream,
//!     Arc::new(LoggingProcessor),
//!     ConsumerLoopConfig::default(),
//!     connection.operation_timeout(),
//! )
//! .run(shutdown_rx)
//! .await;
//!
//! connection.close().await?;
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod descriptor;
pub mod dlq;
pub mod error;
pub mod item;
pub mod metrics;
pub mod nats;
pub mod processor;
pub mod producer;
pub mod provision;
mod schedule;
pub mod subject;

pub use broker::memory::{MemoryBroker, MemoryConnection};
pub use broker::{
    AckKind, Broker, ConsumerApi, ConsumerState, Delivery, Publish, PublishAck, StreamApi,
    StreamState,
};
pub use config::{
    AckMode, BackoffStrategy, ConnectionConfig, ConsumerLoopConfig, DecodeFailurePolicy,
    FetchMode, JitteredInterval, ProducerConfig, DEFAULT_NATS_URL,
};
pub use connection::{ConnectionEvent, ConnectionSnapshot, ManagedConnection};
pub use consumer::{ConsumerLoop, ConsumerSummary};
pub use descriptor::{
    AckPolicy, ConsumerDescriptor, DiscardPolicy, EventsQueue, QueueDef, RetentionPolicy,
    StorageClass, StreamDescriptor, SubmitTxQueue,
};
pub use dlq::{DeadLetterEntry, DeadLetterPublisher};
pub use error::{BrokerError, ErrorCategory, ProcessingError, WorkQueueError};
pub use item::WorkItem;
pub use metrics::{init_metrics, WorkQueueMetrics};
pub use nats::{ConnectionManager, JetStreamBroker};
pub use processor::{FailingProcessor, LoggingProcessor, NoOpProcessor, Processor};
pub use producer::{ProducerLoop, ProducerSummary};
pub use provision::{ConsumerHandle, Provisioner, StreamHandle};
