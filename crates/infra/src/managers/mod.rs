//! Typed wrappers over the bus: one place to emit each event kind, one place
//! to bind handlers to subscriptions.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerManager, SubscribeError};
pub use producer::{ProduceError, ProducerManager};
