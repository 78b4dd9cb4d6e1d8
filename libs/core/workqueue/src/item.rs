//! The unit of work carried through the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkQueueError;

/// A timestamped work item.
///
/// Serialized as JSON on the wire:
///
/// ```json
/// {"id":"5b0c…","payload":"2024-05-01T10:00:00+00:00","created_at":"2024-05-01T10:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Random per-item identifier.
    pub id: Uuid,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }

    /// An item whose payload is its own creation time in RFC 3339.
    pub fn timestamped() -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payload: created_at.to_rfc3339(),
            created_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WorkQueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WorkQueueError> {
        serde_json::from_slice(bytes).map_err(WorkQueueError::Decode)
    }
}
