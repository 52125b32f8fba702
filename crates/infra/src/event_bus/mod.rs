//! Infrastructure event bus implementations.
//!
//! The bus traits and the in-memory broker live in `storefront-events`. This
//! module provides broker-backed implementations (Redis Streams).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConsumer, RedisStreamsError, RedisStreamsEventBus};
