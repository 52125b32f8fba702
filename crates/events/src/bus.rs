//! Producer/consumer contracts for a topic-addressed broker (mechanics only).
//!
//! Delivery model:
//!
//! - **At-least-once**: a delivery that is not committed is handed out again on a
//!   later `fetch`; handlers must be idempotent.
//! - **Per-topic order**: a consumer sees one topic's messages in publish order.
//!   Nothing is promised across topics.
//! - **Sequential consumers**: one consumer serves one `(group, topic)` pair and
//!   returns the next message only after the current one is committed.
//!
//! ```text
//! Producer::emit ──▶ broker log (per topic) ──▶ Consumer::fetch ─▶ decode ─▶ handle ─▶ Consumer::commit
//!                                                      ▲                                │
//!                                                      └──────── not committed ◀────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::EventEnvelope;
use crate::topic::Topic;

/// Broker-specific position of a delivery, echoed back on commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryTag {
    /// Offset into an append-only log.
    Offset(u64),
    /// Stream entry id (e.g. `1700000000000-0`).
    Entry(String),
}

/// A message handed to a consumer, not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub tag: DeliveryTag,
    /// How many times the broker has handed this message to the group (1 on first delivery).
    pub attempt: u32,
}

/// Publish side of the bus.
///
/// `emit` returns only after the broker has durably accepted the envelope. Any
/// failure is surfaced; the caller decides whether to retry.
pub trait Producer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn emit(&self, envelope: EventEnvelope) -> Result<(), Self::Error>;
}

/// One sequential reader of a `(group, topic)` pair.
pub trait Consumer: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait up to `timeout` for the next uncommitted message.
    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, Self::Error>;

    /// Mark `delivery` as processed so it is not handed out again.
    fn commit(&mut self, delivery: &Delivery) -> Result<(), Self::Error>;

    fn topic(&self) -> Topic;
}

/// A broker that can both publish and open consumers.
pub trait EventBus: Producer {
    type Consumer: Consumer + 'static;

    /// Open a consumer for `topic` within consumer group `group`.
    ///
    /// Consumers in the same group share one committed position per topic.
    fn subscribe(&self, group: &str, topic: Topic) -> Result<Self::Consumer, Self::Error>;
}

impl<P> Producer for Arc<P>
where
    P: Producer + ?Sized,
{
    type Error = P::Error;

    fn emit(&self, envelope: EventEnvelope) -> Result<(), Self::Error> {
        (**self).emit(envelope)
    }
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Consumer = B::Consumer;

    fn subscribe(&self, group: &str, topic: Topic) -> Result<Self::Consumer, Self::Error> {
        (**self).subscribe(group, topic)
    }
}
