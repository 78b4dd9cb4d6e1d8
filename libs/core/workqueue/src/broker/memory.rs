//! In-process broker with JetStream stream/consumer semantics.
//!
//! Streams capture subjects by wildcard pattern, consumers pull with explicit
//! acknowledgement, unacknowledged deliveries come back after ack-wait, and
//! work-queue streams refuse overlapping consumers with the same error codes
//! a NATS server uses.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    AckKind, Acknowledge, Broker, ConsumerApi, ConsumerState, Delivery, Publish, PublishAck,
    StreamApi, StreamState,
};
use crate::config::FetchMode;
use crate::connection::{ConnectionEvent, ManagedConnection, EVENT_CHANNEL_CAPACITY};
use crate::descriptor::{
    AckPolicy, ConsumerDescriptor, DiscardPolicy, RetentionPolicy, StreamDescriptor,
};
use crate::error::{codes, BrokerError, WorkQueueError};
use crate::subject;

/// Upper bound on how long a waiting fetch sleeps before re-checking
/// ack-wait and nak-delay deadlines.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Cheaply cloneable handle on an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct State {
    streams: BTreeMap<String, StreamSlot>,
}

impl State {
    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamSlot, BrokerError> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("stream '{name}'")))
    }
}

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    stored_at: Instant,
}

struct StreamSlot {
    descriptor: StreamDescriptor,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    bytes: u64,
    consumers: BTreeMap<String, ConsumerSlot>,
}

struct ConsumerSlot {
    descriptor: ConsumerDescriptor,
    /// Delivered and unacknowledged, with the instant it becomes redeliverable
    in_flight: HashMap<u64, Instant>,
    deliveries: HashMap<u64, u64>,
    acked: BTreeSet<u64>,
    redelivered: u64,
}

impl ConsumerSlot {
    fn new(descriptor: ConsumerDescriptor) -> Self {
        Self {
            descriptor,
            in_flight: HashMap::new(),
            deliveries: HashMap::new(),
            acked: BTreeSet::new(),
            redelivered: 0,
        }
    }

    fn can_deliver(&self, sequence: u64, message: &StoredMessage) -> bool {
        if self.acked.contains(&sequence)
            || self.in_flight.contains_key(&sequence)
            || !self.descriptor.is_interested_in(&message.subject)
        {
            return false;
        }
        let delivered = self.deliveries.get(&sequence).copied().unwrap_or(0);
        self.descriptor.max_deliver < 0 || delivered < self.descriptor.max_deliver as u64
    }
}

impl StreamSlot {
    fn new(descriptor: StreamDescriptor) -> Self {
        Self {
            descriptor,
            messages: BTreeMap::new(),
            last_sequence: 0,
            bytes: 0,
            consumers: BTreeMap::new(),
        }
    }

    fn state(&self) -> StreamState {
        let subjects: BTreeSet<&str> = self
            .messages
            .values()
            .map(|message| message.subject.as_str())
            .collect();
        let first_sequence = match self.messages.keys().next() {
            Some(sequence) => *sequence,
            None if self.last_sequence == 0 => 0,
            None => self.last_sequence + 1,
        };

        StreamState {
            messages: self.messages.len() as u64,
            bytes: self.bytes,
            subjects: subjects.len() as u64,
            consumers: self.consumers.len(),
            first_sequence,
            last_sequence: self.last_sequence,
        }
    }

    fn store(
        &mut self,
        subject: &str,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<PublishAck, BrokerError> {
        self.expire(now);

        let size = payload.len() as u64;
        if self.descriptor.max_bytes > 0 && size > self.descriptor.max_bytes as u64 {
            return Err(BrokerError::Rejected("message size exceeds maximum bytes".into()));
        }
        while let Some(limit) = self.exceeded_limit(size) {
            match self.descriptor.discard {
                DiscardPolicy::New => {
                    return Err(BrokerError::Rejected(format!("maximum {limit} exceeded")))
                }
                DiscardPolicy::Old => match self.messages.keys().next().copied() {
                    Some(oldest) => self.remove(oldest),
                    None => break,
                },
            }
        }

        self.last_sequence += 1;
        let sequence = self.last_sequence;
        self.bytes += size;
        self.messages.insert(
            sequence,
            StoredMessage {
                subject: subject.to_string(),
                payload,
                stored_at: now,
            },
        );

        if self.descriptor.retention == RetentionPolicy::Interest
            && !self
                .consumers
                .values()
                .any(|consumer| consumer.descriptor.is_interested_in(subject))
        {
            self.remove(sequence);
        }

        Ok(PublishAck {
            stream: self.descriptor.name.clone(),
            sequence,
            duplicate: false,
        })
    }

    fn exceeded_limit(&self, incoming: u64) -> Option<&'static str> {
        let descriptor = &self.descriptor;
        if descriptor.max_messages > 0
            && self.messages.len() as u64 + 1 > descriptor.max_messages as u64
        {
            return Some("messages");
        }
        if descriptor.max_bytes > 0 && self.bytes + incoming > descriptor.max_bytes as u64 {
            return Some("bytes");
        }
        None
    }

    fn expire(&mut self, now: Instant) {
        let max_age = self.descriptor.max_age;
        if max_age.is_zero() {
            return;
        }
        let expired: Vec<u64> = self
            .messages
            .iter()
            .take_while(|(_, message)| message.stored_at + max_age <= now)
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in expired {
            self.remove(sequence);
        }
    }

    fn remove(&mut self, sequence: u64) {
        if let Some(message) = self.messages.remove(&sequence) {
            self.bytes = self.bytes.saturating_sub(message.payload.len() as u64);
        }
        for consumer in self.consumers.values_mut() {
            consumer.in_flight.remove(&sequence);
            consumer.deliveries.remove(&sequence);
            consumer.acked.remove(&sequence);
        }
    }

    /// Drop interest-retained messages nobody is waiting on any more.
    fn sweep_interest(&mut self) {
        if self.descriptor.retention != RetentionPolicy::Interest {
            return;
        }
        let settled: Vec<u64> = self
            .messages
            .iter()
            .filter(|(sequence, message)| {
                self.consumers
                    .values()
                    .filter(|consumer| consumer.descriptor.is_interested_in(&message.subject))
                    .all(|consumer| consumer.acked.contains(*sequence))
            })
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in settled {
            self.remove(sequence);
        }
    }

    fn create_consumer(&mut self, descriptor: &ConsumerDescriptor) -> Result<(), BrokerError> {
        if let Some(existing) = self.consumers.get(&descriptor.name) {
            if existing.descriptor == *descriptor {
                return Ok(());
            }
            return Err(BrokerError::from_api(
                codes::CONSUMER_ALREADY_EXISTS,
                "consumer already exists",
            ));
        }

        if let Some(filter) = &descriptor.filter_subject {
            if !self
                .descriptor
                .subjects
                .iter()
                .any(|pattern| subject::overlaps(filter, pattern))
            {
                return Err(BrokerError::Request(format!(
                    "consumer filter subject '{filter}' is not a valid subset of the interest subjects"
                )));
            }
        }

        if self.descriptor.retention == RetentionPolicy::WorkQueue && !self.consumers.is_empty() {
            match &descriptor.filter_subject {
                None => {
                    return Err(BrokerError::from_api(
                        codes::WORKQUEUE_MULTIPLE_UNFILTERED,
                        "multiple non-filtered consumers not allowed on workqueue stream",
                    ))
                }
                Some(filter) => {
                    let clash = self.consumers.values().any(|consumer| {
                        consumer
                            .descriptor
                            .filter_subject
                            .as_deref()
                            .map_or(true, |other| subject::overlaps(other, filter))
                    });
                    if clash {
                        return Err(BrokerError::from_api(
                            codes::WORKQUEUE_NOT_UNIQUE,
                            "filtered consumer not unique on workqueue stream",
                        ));
                    }
                }
            }
        }

        self.consumers.insert(
            descriptor.name.clone(),
            ConsumerSlot::new(descriptor.clone()),
        );
        Ok(())
    }

    fn take_batch(
        &mut self,
        shared: &Arc<Shared>,
        consumer_name: &str,
        max: usize,
        now: Instant,
    ) -> Result<Vec<Delivery>, BrokerError> {
        self.expire(now);

        let stream_name = self.descriptor.name.clone();
        let StreamSlot {
            messages,
            consumers,
            ..
        } = &mut *self;
        let consumer = consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer '{consumer_name}'")))?;
        consumer.in_flight.retain(|_, redeliver_at| *redeliver_at > now);

        let mut batch = Vec::new();
        let mut auto_acked = Vec::new();
        for (sequence, message) in messages.iter() {
            if batch.len() >= max {
                break;
            }
            if !consumer.can_deliver(*sequence, message) {
                continue;
            }

            let count = consumer.deliveries.entry(*sequence).or_insert(0);
            *count += 1;
            let delivered = *count;
            if delivered > 1 {
                consumer.redelivered += 1;
            }
            match consumer.descriptor.ack_policy {
                AckPolicy::Explicit => {
                    consumer
                        .in_flight
                        .insert(*sequence, now + consumer.descriptor.ack_wait);
                }
                AckPolicy::None => auto_acked.push(*sequence),
            }

            batch.push(Delivery::new(
                message.subject.clone(),
                message.payload.clone(),
                *sequence,
                delivered,
                Box::new(MemoryAck {
                    shared: shared.clone(),
                    stream: stream_name.clone(),
                    consumer: consumer_name.to_string(),
                    sequence: *sequence,
                }),
            ));
        }

        for sequence in auto_acked {
            self.settle(consumer_name, sequence, AckKind::Ack, now)?;
        }
        Ok(batch)
    }

    fn settle(
        &mut self,
        consumer_name: &str,
        sequence: u64,
        kind: AckKind,
        now: Instant,
    ) -> Result<(), BrokerError> {
        let consumer = self
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer '{consumer_name}'")))?;
        let Some(message) = self.messages.get(&sequence) else {
            return Ok(());
        };

        match kind {
            AckKind::Nak(delay) => {
                if consumer.in_flight.contains_key(&sequence) {
                    match delay {
                        Some(delay) if !delay.is_zero() => {
                            consumer.in_flight.insert(sequence, now + delay);
                        }
                        _ => {
                            consumer.in_flight.remove(&sequence);
                        }
                    }
                }
                return Ok(());
            }
            AckKind::Ack | AckKind::AckConfirmed | AckKind::Term => {
                consumer.in_flight.remove(&sequence);
                consumer.acked.insert(sequence);
            }
        }

        let remove = match self.descriptor.retention {
            RetentionPolicy::WorkQueue => true,
            RetentionPolicy::Interest => self
                .consumers
                .values()
                .filter(|consumer| consumer.descriptor.is_interested_in(&message.subject))
                .all(|consumer| consumer.acked.contains(&sequence)),
            RetentionPolicy::Limits => false,
        };
        if remove {
            self.remove(sequence);
        }
        Ok(())
    }

    fn consumer_state(&self, consumer_name: &str, now: Instant) -> Result<ConsumerState, BrokerError> {
        let consumer = self
            .consumers
            .get(consumer_name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer '{consumer_name}'")))?;

        let pending = self
            .messages
            .iter()
            .filter(|(sequence, message)| {
                let expired = consumer
                    .in_flight
                    .get(*sequence)
                    .is_some_and(|redeliver_at| *redeliver_at <= now);
                expired || consumer.can_deliver(**sequence, message)
            })
            .count() as u64;
        let ack_pending = consumer
            .in_flight
            .values()
            .filter(|redeliver_at| **redeliver_at > now)
            .count() as u64;

        Ok(ConsumerState {
            pending,
            ack_pending,
            redelivered: consumer.redelivered,
        })
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_handle(&self, descriptor: &StreamDescriptor) -> Arc<dyn StreamApi> {
        Arc::new(MemoryStream {
            shared: self.shared.clone(),
            name: descriptor.name.clone(),
            subjects: descriptor.subjects.clone(),
        })
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn lookup_stream(&self, name: &str) -> Result<Option<Arc<dyn StreamApi>>, BrokerError> {
        let state = self.shared.lock();
        Ok(state
            .streams
            .get(name)
            .map(|slot| self.stream_handle(&slot.descriptor)))
    }

    async fn create_stream(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Arc<dyn StreamApi>, BrokerError> {
        let mut state = self.shared.lock();

        if let Some(existing) = state.streams.get(&descriptor.name) {
            if existing.descriptor == *descriptor {
                return Ok(self.stream_handle(descriptor));
            }
            return Err(BrokerError::from_api(
                codes::STREAM_NAME_IN_USE,
                "stream name already in use with a different configuration",
            ));
        }

        let overlap = state.streams.values().find_map(|slot| {
            slot.descriptor
                .subjects
                .iter()
                .find(|pattern| {
                    descriptor
                        .subjects
                        .iter()
                        .any(|candidate| subject::overlaps(pattern, candidate))
                })
                .map(|pattern| format!("{} ({pattern})", slot.descriptor.name))
        });
        if let Some(existing) = overlap {
            return Err(BrokerError::from_api(
                codes::STREAM_SUBJECT_OVERLAP,
                format!("subjects overlap with an existing stream: {existing}"),
            ));
        }

        state
            .streams
            .insert(descriptor.name.clone(), StreamSlot::new(descriptor.clone()));
        debug!(stream = %descriptor.name, "In-memory stream created");
        Ok(self.stream_handle(descriptor))
    }
}

#[async_trait]
impl Publish for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<PublishAck, BrokerError> {
        if !subject::is_valid(subject, false) {
            return Err(BrokerError::Request(format!(
                "invalid publish subject '{subject}'"
            )));
        }

        let ack = {
            let mut state = self.shared.lock();
            let slot = state
                .streams
                .values_mut()
                .find(|slot| slot.descriptor.accepts(subject))
                .ok_or_else(|| BrokerError::NoStream(subject.to_string()))?;
            slot.store(subject, payload, Instant::now())?
        };
        self.shared.notify.notify_waiters();
        Ok(ack)
    }
}

struct MemoryStream {
    shared: Arc<Shared>,
    name: String,
    subjects: Vec<String>,
}

impl MemoryStream {
    fn consumer_handle(&self, descriptor: &ConsumerDescriptor) -> Arc<dyn ConsumerApi> {
        Arc::new(MemoryConsumer {
            shared: self.shared.clone(),
            stream: self.name.clone(),
            name: descriptor.name.clone(),
            filter: descriptor.filter_subject.clone(),
        })
    }
}

#[async_trait]
impl StreamApi for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn subjects(&self) -> &[String] {
        &self.subjects
    }

    async fn info(&self) -> Result<StreamState, BrokerError> {
        let mut state = self.shared.lock();
        let slot = state.stream_mut(&self.name)?;
        slot.expire(Instant::now());
        Ok(slot.state())
    }

    async fn lookup_consumer(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn ConsumerApi>>, BrokerError> {
        let mut state = self.shared.lock();
        let slot = state.stream_mut(&self.name)?;
        Ok(slot
            .consumers
            .get(name)
            .map(|consumer| self.consumer_handle(&consumer.descriptor)))
    }

    async fn create_consumer(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> Result<Arc<dyn ConsumerApi>, BrokerError> {
        {
            let mut state = self.shared.lock();
            state.stream_mut(&self.name)?.create_consumer(descriptor)?;
        }
        debug!(stream = %self.name, consumer = %descriptor.name, "In-memory consumer created");
        Ok(self.consumer_handle(descriptor))
    }

    async fn delete_consumer(&self, name: &str) -> Result<bool, BrokerError> {
        let removed = {
            let mut state = self.shared.lock();
            let slot = state.stream_mut(&self.name)?;
            let removed = slot.consumers.remove(name).is_some();
            slot.sweep_interest();
            removed
        };
        Ok(removed)
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    stream: String,
    name: String,
    filter: Option<String>,
}

impl MemoryConsumer {
    fn take_batch(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut state = self.shared.lock();
        state
            .stream_mut(&self.stream)?
            .take_batch(&self.shared, &self.name, max, Instant::now())
    }
}

#[async_trait]
impl ConsumerApi for MemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_subject(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    async fn fetch(&self, max: usize, mode: FetchMode) -> Result<Vec<Delivery>, BrokerError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = match mode {
            FetchMode::NoWait => None,
            FetchMode::Wait(wait) => Some(Instant::now() + wait),
        };

        loop {
            let notified = self.shared.notify.notified();
            let batch = self.take_batch(max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout((deadline - now).min(WAIT_POLL), notified).await;
        }
    }

    async fn info(&self) -> Result<ConsumerState, BrokerError> {
        let mut state = self.shared.lock();
        let slot = state.stream_mut(&self.stream)?;
        let now = Instant::now();
        slot.expire(now);
        slot.consumer_state(&self.name, now)
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.lock();
            state
                .stream_mut(&self.stream)?
                .settle(&self.consumer, self.sequence, kind, Instant::now())?;
        }
        if matches!(kind, AckKind::Nak(_)) {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

/// [`ManagedConnection`] over a [`MemoryBroker`].
///
/// Counts `close` calls so callers can verify the drain ran.
pub struct MemoryConnection {
    broker: MemoryBroker,
    events: broadcast::Sender<ConnectionEvent>,
    closes: Arc<AtomicUsize>,
    operation_timeout: Duration,
}

impl MemoryConnection {
    pub fn new(broker: MemoryBroker) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            broker,
            events,
            closes: Arc::new(AtomicUsize::new(0)),
            operation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Shared counter of completed `close` calls.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }

    /// Inject a connection event, as the transport would.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ManagedConnection for MemoryConnection {
    fn broker(&self) -> Arc<dyn Broker> {
        Arc::new(self.broker.clone())
    }

    fn publisher(&self) -> Arc<dyn Publish> {
        Arc::new(self.broker.clone())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    async fn close(self) -> Result<(), WorkQueueError> {
        let closes = self.closes.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.events.send(ConnectionEvent::Closed);
        info!(closes, "In-memory connection closed");
        Ok(())
    }
}
