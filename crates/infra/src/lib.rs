//! Infrastructure layer: stores, broker adapters, outbox relay, subscription
//! workers, and the service-level workflows built on them.

pub mod catalog;
pub mod config;
pub mod event_bus;
pub mod handlers;
pub mod managers;
pub mod order_placement;
pub mod outbox;
pub mod services;
pub mod store;
pub mod workers;
