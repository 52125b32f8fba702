use serde::Serialize;

use crate::integration::{
    OrderPlaced, ProductCreated, ProductInventoryUpdated, UserProfileUpdated, UserRegistered,
};
use crate::topic::Topic;

/// A typed integration event.
///
/// Events are immutable facts. Each kind has a stable wire name and travels on
/// exactly one topic; a subscription is bound to one concrete `Event` type.
pub trait Event: Serialize + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name carried in the envelope (e.g. `"OrderPlaced"`).
    const NAME: &'static str;

    /// Topic this event kind is published on.
    const TOPIC: Topic;

    fn into_domain(self) -> DomainEvent;

    /// Extract this kind from the union, `None` for any other variant.
    fn from_domain(event: DomainEvent) -> Option<Self>;
}

/// Closed union of every event kind the platform knows about.
///
/// New kinds are added here (and to the decoder's `match`), never registered at
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    UserRegistered(UserRegistered),
    UserProfileUpdated(UserProfileUpdated),
    ProductCreated(ProductCreated),
    ProductInventoryUpdated(ProductInventoryUpdated),
    OrderPlaced(OrderPlaced),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserRegistered(_) => UserRegistered::NAME,
            DomainEvent::UserProfileUpdated(_) => UserProfileUpdated::NAME,
            DomainEvent::ProductCreated(_) => ProductCreated::NAME,
            DomainEvent::ProductInventoryUpdated(_) => ProductInventoryUpdated::NAME,
            DomainEvent::OrderPlaced(_) => OrderPlaced::NAME,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            DomainEvent::UserRegistered(_) => UserRegistered::TOPIC,
            DomainEvent::UserProfileUpdated(_) => UserProfileUpdated::TOPIC,
            DomainEvent::ProductCreated(_) => ProductCreated::TOPIC,
            DomainEvent::ProductInventoryUpdated(_) => ProductInventoryUpdated::TOPIC,
            DomainEvent::OrderPlaced(_) => OrderPlaced::TOPIC,
        }
    }
}
