use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{DomainEvent, Event};
use crate::topic::Topic;

/// Wire unit carried by the bus.
///
/// Notes:
/// - `event_id` is assigned once (the outbox row id) and survives redelivery, so
///   consumers can use it as a dedup key.
/// - `payload` is the UTF-8 JSON encoding of the event struct. There is exactly
///   one encoding; decoders never sniff for alternatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    event_id: Uuid,
    topic: Topic,
    event_name: String,
    payload: Vec<u8>,
    occurred_at: DateTime<Utc>,
}

/// Failure to serialize an event payload.
#[derive(Debug, Error)]
#[error("failed to encode {event_name}: {source}")]
pub struct EncodeError {
    pub event_name: &'static str,
    #[source]
    pub source: serde_json::Error,
}

impl EventEnvelope {
    pub fn new(
        event_id: Uuid,
        topic: Topic,
        event_name: impl Into<String>,
        payload: Vec<u8>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            topic,
            event_name: event_name.into(),
            payload,
            occurred_at,
        }
    }

    /// Encode a typed event under the given id.
    pub fn from_event<E: Event>(event_id: Uuid, event: &E) -> Result<Self, EncodeError> {
        let payload = serde_json::to_vec(event).map_err(|source| EncodeError {
            event_name: E::NAME,
            source,
        })?;
        Ok(Self::new(event_id, E::TOPIC, E::NAME, payload, Utc::now()))
    }

    /// Encode any member of the union.
    pub fn from_domain(event_id: Uuid, event: &DomainEvent) -> Result<Self, EncodeError> {
        match event {
            DomainEvent::UserRegistered(e) => Self::from_event(event_id, e),
            DomainEvent::UserProfileUpdated(e) => Self::from_event(event_id, e),
            DomainEvent::ProductCreated(e) => Self::from_event(event_id, e),
            DomainEvent::ProductInventoryUpdated(e) => Self::from_event(event_id, e),
            DomainEvent::OrderPlaced(e) => Self::from_event(event_id, e),
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
