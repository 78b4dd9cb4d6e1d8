//! Configuration types for the connection and the producer/consumer loops.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::WorkQueueError;

/// Default broker address (loopback, standard NATS port).
pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

/// Connection settings for the broker transport.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Broker address, e.g. `nats://127.0.0.1:4222`
    pub address: String,

    /// Client name reported to the broker
    pub name: String,

    /// Keepalive ping interval
    pub ping_interval: Duration,

    /// Retry the initial connect and let the transport reconnect after a drop
    pub auto_reconnect: bool,

    /// Attempt ceiling for the initial connect and for reconnects
    pub max_reconnects: usize,

    /// Delay between connection attempts
    pub reconnect_backoff: BackoffStrategy,

    /// Outbound messages buffered while disconnected
    pub reconnect_buffer: usize,

    /// Timeout of a single connection attempt
    pub connection_timeout: Duration,

    /// Bound on every broker request (lookups, publish, fetch, ack, flush)
    pub operation_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_NATS_URL.to_string(),
            name: "workqueue".to_string(),
            ping_interval: Duration::from_secs(20),
            auto_reconnect: true,
            max_reconnects: 10,
            reconnect_backoff: BackoffStrategy::Fixed(Duration::from_secs(2)),
            reconnect_buffer: 2048,
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnects = max;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_reconnect_buffer(mut self, capacity: usize) -> Self {
        self.reconnect_buffer = capacity;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Number of initial connect attempts before giving up.
    pub fn connect_attempts(&self) -> u32 {
        if self.auto_reconnect {
            u32::try_from(self.max_reconnects.max(1)).unwrap_or(u32::MAX)
        } else {
            1
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),

    /// Exponential backoff (base * 2^retry_count, capped at max)
    Exponential { base: Duration, max: Duration },

    /// Linear backoff (base * (retry_count + 1), capped at max)
    Linear { base: Duration, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given retry count.
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => {
                let delay = base.saturating_mul(2u32.saturating_pow(retry_count));
                delay.min(*max)
            }
            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry_count.saturating_add(1));
                delay.min(*max)
            }
        }
    }
}

/// A period randomized within `base ± base * jitter`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitteredInterval {
    base: Duration,
    jitter: f64,
}

impl JitteredInterval {
    /// `jitter` is a fraction of `base`, clamped to `0.0..=1.0`.
    pub fn new(base: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { base, jitter }
    }

    pub fn fixed(base: Duration) -> Self {
        Self::new(base, 0.0)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn min(&self) -> Duration {
        self.base.mul_f64(1.0 - self.jitter)
    }

    pub fn max(&self) -> Duration {
        self.base.mul_f64(1.0 + self.jitter)
    }

    /// Draw the next delay.
    pub fn next_delay(&self) -> Duration {
        if self.jitter == 0.0 || self.base.is_zero() {
            return self.base;
        }
        let low = self.min().as_secs_f64();
        let high = self.max().as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
    }
}

/// How a fetch waits for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Return immediately with whatever is pending, possibly nothing.
    #[default]
    NoWait,
    /// Wait up to the bound for at least one message.
    Wait(Duration),
}

impl FetchMode {
    /// `0` means no-wait.
    pub fn from_millis(wait_ms: u64) -> Self {
        if wait_ms == 0 {
            FetchMode::NoWait
        } else {
            FetchMode::Wait(Duration::from_millis(wait_ms))
        }
    }
}

/// Acknowledgement strength used for processed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Send the ack without waiting for the broker to confirm it.
    #[default]
    FireAndForget,
    /// Wait until the broker confirms it observed the ack.
    Confirmed,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::FireAndForget => write!(f, "ack"),
            AckMode::Confirmed => write!(f, "confirm"),
        }
    }
}

impl FromStr for AckMode {
    type Err = WorkQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" | "fire-and-forget" => Ok(AckMode::FireAndForget),
            "confirm" | "confirmed" | "double" => Ok(AckMode::Confirmed),
            other => Err(WorkQueueError::Config(format!(
                "unknown ack mode '{other}', expected 'ack' or 'confirm'"
            ))),
        }
    }
}

/// What the consumer loop does with a payload that is not a valid work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Log and acknowledge; the malformed message is dropped.
    #[default]
    Acknowledge,
    /// Log and terminate; the broker never redelivers it.
    Terminate,
    /// Republish a dead-letter entry through the loop's
    /// [`DeadLetterPublisher`](crate::DeadLetterPublisher), then acknowledge.
    DeadLetter,
}

impl fmt::Display for DecodeFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailurePolicy::Acknowledge => write!(f, "ack"),
            DecodeFailurePolicy::Terminate => write!(f, "term"),
            DecodeFailurePolicy::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

impl FromStr for DecodeFailurePolicy {
    type Err = WorkQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(DecodeFailurePolicy::Acknowledge),
            "term" | "terminate" => Ok(DecodeFailurePolicy::Terminate),
            "dead-letter" | "dlq" => Ok(DecodeFailurePolicy::DeadLetter),
            other => Err(WorkQueueError::Config(format!(
                "unknown decode failure policy '{other}', expected 'ack', 'term' or 'dead-letter'"
            ))),
        }
    }
}

/// Producer loop settings.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Subject every work item is published to
    pub subject: String,

    /// Tick period between publishes
    pub interval: JitteredInterval,
}

impl ProducerConfig {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            interval: JitteredInterval::new(Duration::from_secs(3), 0.5),
        }
    }

    pub fn with_interval(mut self, interval: JitteredInterval) -> Self {
        self.interval = interval;
        self
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerLoopConfig {
    /// Maximum deliveries per fetch
    pub batch_size: usize,

    pub fetch_mode: FetchMode,

    /// Tick period between fetches
    pub interval: JitteredInterval,

    pub ack_mode: AckMode,

    pub decode_failure: DecodeFailurePolicy,

    /// Negative-ack delay for transient processing failures, by delivery count
    pub nak_backoff: BackoffStrategy,
}

impl Default for ConsumerLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_mode: FetchMode::NoWait,
            interval: JitteredInterval::new(Duration::from_secs(5), 0.5),
            ack_mode: AckMode::FireAndForget,
            decode_failure: DecodeFailurePolicy::Acknowledge,
            nak_backoff: BackoffStrategy::default(),
        }
    }
}

impl ConsumerLoopConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_fetch_mode(mut self, mode: FetchMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    pub fn with_interval(mut self, interval: JitteredInterval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn with_decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    pub fn with_nak_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.nak_backoff = backoff;
        self
    }
}
