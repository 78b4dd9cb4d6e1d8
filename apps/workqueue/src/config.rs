//! Worker configuration loaded from environment variables.

use core_config::{env_or_default, env_parse, env_parse_optional, ConfigError, FromEnv};
use std::env;
use std::time::Duration;
use workqueue::{
    AckMode, BackoffStrategy, ConnectionConfig, ConsumerDescriptor, ConsumerLoopConfig,
    DeadLetterPublisher, DecodeFailurePolicy, FetchMode, JitteredInterval, ProducerConfig,
    QueueDef, StreamDescriptor, SubmitTxQueue, DEFAULT_NATS_URL,
};

/// Jitter applied to both loop ticks so replicas drift apart.
const TICK_JITTER: f64 = 0.5;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub nats_url: String,

    /// Connection name reported to the server
    pub worker_id: String,

    pub stream_name: String,
    pub stream_subject: String,
    pub consumer_name: String,
    pub filter_subject: Option<String>,

    pub publish_interval: Duration,
    pub fetch_interval: Duration,
    pub fetch_batch: usize,
    pub fetch_mode: FetchMode,
    pub ack_mode: AckMode,
    pub decode_failure: DecodeFailurePolicy,

    /// Defaults to `<stream>_dlq.failed`
    pub dead_letter_subject: String,

    pub max_reconnects: usize,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub reconnect_buffer: usize,
    pub operation_timeout: Duration,

    /// Prometheus exporter port; no exporter when unset
    pub metrics_port: Option<u16>,
}

impl FromEnv for Config {
    fn from_env() -> Result<Self, ConfigError> {
        let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| {
            format!(
                "workqueue-{}",
                uuid::Uuid::new_v4()
                    .to_string()
                    .split('-')
                    .next()
                    .unwrap_or("0")
            )
        });

        let stream_name = env_or_default("STREAM_NAME", SubmitTxQueue::STREAM_NAME);
        let stream_subject = env_or_default("STREAM_SUBJECT", SubmitTxQueue::SUBJECTS[0]);
        let consumer_name = env_or_default("CONSUMER_NAME", SubmitTxQueue::CONSUMER_NAME);
        let filter_subject = env::var("FILTER_SUBJECT")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let fetch_batch: usize = env_parse("FETCH_BATCH", 10)?;
        if fetch_batch == 0 {
            return Err(ConfigError::ParseError {
                key: "FETCH_BATCH".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        let ack_mode: AckMode = env_parse("ACK_MODE", AckMode::FireAndForget)?;
        let decode_failure: DecodeFailurePolicy =
            env_parse("DECODE_FAILURE", DecodeFailurePolicy::Acknowledge)?;
        let dead_letter_subject = env::var("DEAD_LETTER_SUBJECT")
            .unwrap_or_else(|_| DeadLetterPublisher::default_subject(&stream_name));

        Ok(Self {
            nats_url: env_or_default("NATS_URL", DEFAULT_NATS_URL),
            worker_id,
            stream_name,
            stream_subject,
            consumer_name,
            filter_subject,
            publish_interval: Duration::from_millis(env_parse("PUBLISH_INTERVAL_MS", 3000)?),
            fetch_interval: Duration::from_millis(env_parse("FETCH_INTERVAL_MS", 5000)?),
            fetch_batch,
            fetch_mode: FetchMode::from_millis(env_parse("FETCH_WAIT_MS", 0)?),
            ack_mode,
            decode_failure,
            dead_letter_subject,
            max_reconnects: env_parse("MAX_RECONNECTS", 10)?,
            reconnect_delay: Duration::from_millis(env_parse("RECONNECT_DELAY_MS", 2000)?),
            ping_interval: Duration::from_secs(env_parse("PING_INTERVAL_SECS", 20)?),
            reconnect_buffer: env_parse("RECONNECT_BUFFER", 2048)?,
            operation_timeout: Duration::from_secs(env_parse("OPERATION_TIMEOUT_SECS", 10)?),
            metrics_port: env_parse_optional("METRICS_PORT")?,
        })
    }
}

impl Config {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.nats_url)
            .with_name(&self.worker_id)
            .with_ping_interval(self.ping_interval)
            .with_auto_reconnect(self.max_reconnects > 0)
            .with_max_reconnects(self.max_reconnects)
            .with_reconnect_backoff(BackoffStrategy::Fixed(self.reconnect_delay))
            .with_reconnect_buffer(self.reconnect_buffer)
            .with_operation_timeout(self.operation_timeout)
    }

    /// The work stream, sized like [`SubmitTxQueue`] but bound to the configured name and subject.
    pub fn stream(&self) -> StreamDescriptor {
        let defaults = StreamDescriptor::from_def::<SubmitTxQueue>();
        StreamDescriptor {
            name: self.stream_name.clone(),
            subjects: vec![self.stream_subject.clone()],
            ..defaults
        }
    }

    pub fn consumer(&self) -> ConsumerDescriptor {
        let mut descriptor = ConsumerDescriptor::from_def::<SubmitTxQueue>();
        descriptor.name = self.consumer_name.clone();
        descriptor.filter_subject = self.filter_subject.clone();
        descriptor
    }

    pub fn producer(&self) -> ProducerConfig {
        ProducerConfig::new(&self.stream_subject)
            .with_interval(JitteredInterval::new(self.publish_interval, TICK_JITTER))
    }

    pub fn consumer_loop(&self) -> ConsumerLoopConfig {
        ConsumerLoopConfig::default()
            .with_batch_size(self.fetch_batch)
            .with_fetch_mode(self.fetch_mode)
            .with_interval(JitteredInterval::new(self.fetch_interval, TICK_JITTER))
            .with_ack_mode(self.ack_mode)
            .with_decode_failure(self.decode_failure)
    }

    /// Stream that captures dead letters; only provisioned under the dead-letter policy.
    pub fn dead_letter_stream(&self) -> Option<StreamDescriptor> {
        match self.decode_failure {
            DecodeFailurePolicy::DeadLetter => Some(DeadLetterPublisher::stream_descriptor(
                &DeadLetterPublisher::stream_name(&self.stream_name),
                &self.dead_letter_subject,
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 20] = [
        "NATS_URL",
        "WORKER_ID",
        "STREAM_NAME",
        "STREAM_SUBJECT",
        "CONSUMER_NAME",
        "FILTER_SUBJECT",
        "PUBLISH_INTERVAL_MS",
        "FETCH_INTERVAL_MS",
        "FETCH_BATCH",
        "FETCH_WAIT_MS",
        "ACK_MODE",
        "DECODE_FAILURE",
        "DEAD_LETTER_SUBJECT",
        "MAX_RECONNECTS",
        "RECONNECT_DELAY_MS",
        "PING_INTERVAL_SECS",
        "RECONNECT_BUFFER",
        "OPERATION_TIMEOUT_SECS",
        "METRICS_PORT",
        "APP_ENV",
    ];

    fn unset_all() -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter().map(|key| (*key, None)).collect()
    }

    fn with_vars<F: FnOnce()>(overrides: &[(&'static str, &'static str)], f: F) {
        let mut vars = unset_all();
        for (key, value) in overrides {
            if let Some(entry) = vars.iter_mut().find(|entry| entry.0 == *key) {
                entry.1 = Some(*value);
            }
        }
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn test_defaults() {
        with_vars(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.nats_url, DEFAULT_NATS_URL);
            assert!(config.worker_id.starts_with("workqueue-"));
            assert_eq!(config.stream_name, "stream-1");
            assert_eq!(config.stream_subject, "submit-tx");
            assert_eq!(config.consumer_name, "consumer-1");
            assert_eq!(config.filter_subject, None);
            assert_eq!(config.publish_interval, Duration::from_secs(3));
            assert_eq!(config.fetch_interval, Duration::from_secs(5));
            assert_eq!(config.fetch_batch, 10);
            assert_eq!(config.fetch_mode, FetchMode::NoWait);
            assert_eq!(config.ack_mode, AckMode::FireAndForget);
            assert_eq!(config.decode_failure, DecodeFailurePolicy::Acknowledge);
            assert_eq!(config.dead_letter_subject, "stream-1_dlq.failed");
            assert_eq!(config.max_reconnects, 10);
            assert_eq!(config.reconnect_delay, Duration::from_secs(2));
            assert_eq!(config.ping_interval, Duration::from_secs(20));
            assert_eq!(config.reconnect_buffer, 2048);
            assert_eq!(config.operation_timeout, Duration::from_secs(10));
            assert_eq!(config.metrics_port, None);
            assert!(config.dead_letter_stream().is_none());
        });
    }

    #[test]
    fn test_overrides() {
        with_vars(
            &[
                ("NATS_URL", "nats://broker:4222"),
                ("WORKER_ID", "worker-a"),
                ("STREAM_NAME", "EVENTS"),
                ("STREAM_SUBJECT", "events.>"),
                ("CONSUMER_NAME", "processor-us"),
                ("FILTER_SUBJECT", "events.us.>"),
                ("FETCH_BATCH", "3"),
                ("FETCH_WAIT_MS", "250"),
                ("ACK_MODE", "confirm"),
                ("DECODE_FAILURE", "dead-letter"),
                ("METRICS_PORT", "9100"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.worker_id, "worker-a");
                assert_eq!(config.fetch_mode, FetchMode::Wait(Duration::from_millis(250)));
                assert_eq!(config.ack_mode, AckMode::Confirmed);
                assert_eq!(config.metrics_port, Some(9100));

                let connection = config.connection();
                assert_eq!(connection.address, "nats://broker:4222");
                assert_eq!(connection.name, "worker-a");

                let stream = config.stream();
                assert_eq!(stream.name, "EVENTS");
                assert_eq!(stream.subjects, vec!["events.>".to_string()]);

                let consumer = config.consumer();
                assert_eq!(consumer.name, "processor-us");
                assert_eq!(consumer.filter_subject.as_deref(), Some("events.us.>"));

                assert_eq!(
                    config.consumer_loop().decode_failure,
                    DecodeFailurePolicy::DeadLetter
                );
                assert_eq!(config.dead_letter_subject, "events_dlq.failed");
                let dlq = config.dead_letter_stream().unwrap();
                assert_eq!(dlq.name, "EVENTS_DLQ");
                assert_eq!(dlq.subjects, vec!["events_dlq.failed".to_string()]);
            },
        );
    }

    #[test]
    fn test_zero_reconnects_disables_auto_reconnect() {
        with_vars(&[("MAX_RECONNECTS", "0")], || {
            let connection = Config::from_env().unwrap().connection();
            assert!(!connection.auto_reconnect);
            assert_eq!(connection.connect_attempts(), 1);
        });
    }

    #[test]
    fn test_parse_errors_name_the_variable() {
        for (key, value) in [
            ("FETCH_BATCH", "many"),
            ("FETCH_BATCH", "0"),
            ("ACK_MODE", "maybe"),
            ("DECODE_FAILURE", "retry"),
            ("METRICS_PORT", "70000"),
            ("PUBLISH_INTERVAL_MS", "-1"),
        ] {
            with_vars(&[(key, value)], || {
                let err = Config::from_env().unwrap_err();
                match err {
                    ConfigError::ParseError { key: failed, .. } => assert_eq!(failed, key),
                    other => panic!("expected parse error for {key}, got {other}"),
                }
            });
        }
    }
}
