//! Shared test utilities for broker integration tests
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//!
//! # Features
//!
//! - `nats` (default): Enables NATS JetStream test infrastructure
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Container-backed tests need a Docker daemon, so mark them ignored and run
//! them with `cargo test -- --ignored`:
//!
//! ```rust,ignore
//! use test_utils::TestNats;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_jetstream_test() {
//!     let nats = TestNats::new().await;
//!     let jetstream = nats.jetstream();
//!
//!     jetstream.create_stream("ORDERS").await.unwrap();
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;
