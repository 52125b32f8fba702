//! Integration events and the transport mechanics that carry them.
//!
//! - `integration`: wire payloads exchanged between services
//! - `event` / `codec`: the closed `DomainEvent` union and the per-service registry
//! - `bus` / `in_memory_bus`: producer and consumer contracts plus an in-process broker
//! - `handler` / `dead_letter`: what a subscription calls and where undeliverable messages go

pub mod bus;
pub mod codec;
pub mod dead_letter;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod integration;
pub mod topic;

pub use bus::{Consumer, Delivery, DeliveryTag, EventBus, Producer};
pub use codec::{DecodeError, EventRegistry, EventRegistryBuilder};
pub use dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink};
pub use envelope::{EncodeError, EventEnvelope};
pub use event::{DomainEvent, Event};
pub use handler::{EventHandler, HandlerError};
pub use in_memory_bus::{InMemoryBroker, InMemoryBusError, InMemoryConsumer};
pub use integration::{
    OrderLine, OrderPlaced, ProductCreated, ProductInventoryUpdated, UserProfileUpdated,
    UserRegistered,
};
pub use topic::{Topic, UnknownTopic};
