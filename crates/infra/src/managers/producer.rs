use tracing::{debug, instrument};
use uuid::Uuid;

use storefront_events::{
    EncodeError, Event, EventEnvelope, OrderPlaced, ProductCreated, ProductInventoryUpdated,
    Producer, UserProfileUpdated, UserRegistered,
};

#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The broker did not acknowledge the envelope.
    #[error("broker rejected {event_name}: {reason}")]
    Broker { event_name: String, reason: String },
}

/// Emits typed events through any `Producer`.
///
/// Each event is encoded with the shared codec, so the envelope's name and
/// topic always match the event type.
#[derive(Debug, Clone)]
pub struct ProducerManager<P> {
    producer: P,
}

impl<P: Producer> ProducerManager<P> {
    pub fn new(producer: P) -> Self {
        Self { producer }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Encode and publish under a fresh event id.
    pub fn emit<E: Event>(&self, event: &E) -> Result<Uuid, ProduceError> {
        let envelope = EventEnvelope::from_event(Uuid::now_v7(), event)?;
        let event_id = envelope.event_id();
        self.emit_envelope(envelope)?;
        Ok(event_id)
    }

    /// Publish an already encoded envelope (outbox rows keep their id).
    #[instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id(), topic = %envelope.topic()),
        err
    )]
    pub fn emit_envelope(&self, envelope: EventEnvelope) -> Result<(), ProduceError> {
        let event_name = envelope.event_name().to_string();
        self.producer
            .emit(envelope)
            .map_err(|e| ProduceError::Broker {
                event_name: event_name.clone(),
                reason: e.to_string(),
            })?;
        debug!(event_name = %event_name, "event emitted");
        Ok(())
    }

    pub fn emit_user_registered(&self, event: &UserRegistered) -> Result<Uuid, ProduceError> {
        self.emit(event)
    }

    pub fn emit_user_profile_updated(&self, event: &UserProfileUpdated) -> Result<Uuid, ProduceError> {
        self.emit(event)
    }

    pub fn emit_product_created(&self, event: &ProductCreated) -> Result<Uuid, ProduceError> {
        self.emit(event)
    }

    pub fn emit_product_inventory_updated(
        &self,
        event: &ProductInventoryUpdated,
    ) -> Result<Uuid, ProduceError> {
        self.emit(event)
    }

    pub fn emit_order_placed(&self, event: &OrderPlaced) -> Result<Uuid, ProduceError> {
        self.emit(event)
    }
}
