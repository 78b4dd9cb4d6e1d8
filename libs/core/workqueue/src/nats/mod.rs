//! NATS JetStream backend.
//!
//! [`ConnectionManager`] owns the async-nats client and implements
//! [`ManagedConnection`](crate::ManagedConnection); [`JetStreamBroker`]
//! implements the broker traits on top of it.

pub mod connection;
pub mod jetstream;

pub use connection::ConnectionManager;
pub use jetstream::JetStreamBroker;
