//! Transactional outbox.
//!
//! Domain writes insert an `OutboxRecord` in the same transaction; the
//! `OutboxRelay` later publishes unsent rows and marks them sent only after the
//! broker acknowledged them. The row id becomes the envelope's `event_id`, so a
//! re-published row is recognizable downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storefront_events::{EncodeError, Event, EventEnvelope, Topic};

use crate::store::StoreError;

pub mod relay;

pub use relay::{OutboxRelay, RelayConfig, RelayReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub topic: Topic,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn for_event<E: Event>(event: &E) -> Result<Self, EncodeError> {
        let envelope = EventEnvelope::from_event(Uuid::now_v7(), event)?;
        Ok(Self {
            id: envelope.event_id(),
            topic: envelope.topic(),
            event_name: envelope.event_name().to_string(),
            payload: envelope.payload().to_vec(),
            created_at: envelope.occurred_at(),
            attempts: 0,
            last_error: None,
            sent_at: None,
        })
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.id,
            self.topic,
            self.event_name.clone(),
            self.payload.clone(),
            self.created_at,
        )
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }
}

impl From<EncodeError> for StoreError {
    fn from(err: EncodeError) -> Self {
        StoreError::Encode(err.to_string())
    }
}
