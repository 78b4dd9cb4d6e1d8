//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that runs a JetStream-enabled NATS server in a container.

use async_nats::Client;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Image tag used unless a test asks for another one.
pub const DEFAULT_TAG: &str = "latest";

const JETSTREAM_READY_ATTEMPTS: u32 = 50;
const JETSTREAM_READY_DELAY: Duration = Duration::from_millis(100);

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Connect your own client with the container address
/// let url = nats.connection_string();
///
/// // Or use the shared client
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    connection_string: String,
}

impl TestNats {
    /// Start the default image with JetStream enabled.
    pub async fn new() -> Self {
        Self::with_tag(DEFAULT_TAG).await
    }

    /// Start a specific image tag with JetStream enabled.
    ///
    /// Returns once the JetStream API answers requests.
    pub async fn with_tag(tag: &str) -> Self {
        let container = Nats::default()
            .with_tag(tag)
            .with_cmd(["-js"])
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");
        let connection_string = format!("nats://127.0.0.1:{host_port}");

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        wait_for_jetstream(&client).await;
        tracing::info!(port = host_port, tag, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for direct stream inspection
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Address for clients that manage their own connection
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!(url = %self.connection_string, "Cleaning up test NATS container");
    }
}

/// Poll `$JS.API.INFO` until the server has JetStream up.
async fn wait_for_jetstream(client: &Client) {
    for attempt in 1..=JETSTREAM_READY_ATTEMPTS {
        match client.request("$JS.API.INFO", "".into()).await {
            Ok(response) if !response.payload.is_empty() => return,
            Ok(_) => {}
            Err(e) => tracing::debug!(attempt, error = %e, "JetStream not ready yet"),
        }
        tokio::time::sleep(JETSTREAM_READY_DELAY).await;
    }
    panic!("JetStream did not become ready");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_nats_connection() {
        let nats = TestNats::new().await;
        let client = nats.client();

        let mut subscriber = client.subscribe("smoke.subject").await.unwrap();
        client
            .publish("smoke.subject", "hello".into())
            .await
            .unwrap();
        client.flush().await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), subscriber.next())
            .await
            .expect("Timeout waiting for message")
            .expect("No message received");
        assert_eq!(message.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_nats_jetstream_enabled() {
        let nats = TestNats::new().await;
        let jetstream = nats.jetstream();

        jetstream
            .create_stream(async_nats::jetstream::stream::Config {
                name: "SMOKE".to_string(),
                subjects: vec!["smoke.>".to_string()],
                ..Default::default()
            })
            .await
            .expect("Failed to create stream");

        let ack = jetstream
            .publish("smoke.hello", "world".into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get ack");
        assert_eq!(ack.sequence, 1);
        assert!(nats.connection_string().starts_with("nats://127.0.0.1:"));
    }
}
