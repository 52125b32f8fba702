//! In-memory broker for tests/dev.
//!
//! Mirrors the semantics of a partitioned log broker closely enough to exercise
//! at-least-once behavior in-process:
//!
//! - one append-only log per topic
//! - one committed offset per `(group, topic)`
//! - `fetch` returns the first uncommitted entry until it is committed
//!
//! Fault injection (`set_available`, `rewind`) lets tests simulate broker outages
//! and duplicate deliveries.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::bus::{Consumer, Delivery, DeliveryTag, EventBus, Producer};
use crate::envelope::EventEnvelope;
use crate::topic::Topic;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoning.
    #[error("in-memory broker lock poisoned")]
    Poisoned,

    /// The broker was switched off via `set_available(false)`.
    #[error("in-memory broker unavailable")]
    Unavailable,

    #[error("delivery tag {0:?} does not belong to this broker")]
    ForeignTag(DeliveryTag),
}

#[derive(Debug, Default)]
struct GroupCursor {
    committed: u64,
    /// Times the entry at `committed` has been handed out.
    deliveries: u32,
}

#[derive(Debug)]
struct BrokerState {
    logs: HashMap<Topic, Vec<EventEnvelope>>,
    cursors: HashMap<(String, Topic), GroupCursor>,
    available: bool,
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    appended: Condvar,
}

/// Cloneable handle to a shared in-process broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    logs: HashMap::new(),
                    cursors: HashMap::new(),
                    available: true,
                }),
                appended: Condvar::new(),
            }),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, InMemoryBusError> {
        self.inner.state.lock().map_err(|_| InMemoryBusError::Poisoned)
    }

    /// Toggle broker availability. While unavailable, `emit`/`fetch`/`commit` fail.
    pub fn set_available(&self, available: bool) -> Result<(), InMemoryBusError> {
        self.lock()?.available = available;
        tracing::debug!(available, "in-memory broker availability changed");
        self.inner.appended.notify_all();
        Ok(())
    }

    /// Move a group's committed offset back, so already-committed messages are
    /// delivered again.
    pub fn rewind(&self, group: &str, topic: Topic, offset: u64) -> Result<(), InMemoryBusError> {
        let mut state = self.lock()?;
        let cursor = state.cursors.entry((group.to_string(), topic)).or_default();
        if offset < cursor.committed {
            tracing::debug!(group, %topic, from = cursor.committed, to = offset, "rewinding committed offset");
            cursor.committed = offset;
            cursor.deliveries = 0;
        }
        drop(state);
        self.inner.appended.notify_all();
        Ok(())
    }

    /// Copy of everything ever published to `topic`, oldest first.
    pub fn published(&self, topic: Topic) -> Vec<EventEnvelope> {
        self.lock()
            .ok()
            .and_then(|s| s.logs.get(&topic).cloned())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: Topic) -> u64 {
        self.lock()
            .ok()
            .and_then(|s| s.cursors.get(&(group.to_string(), topic)).map(|c| c.committed))
            .unwrap_or(0)
    }

    /// Messages on `topic` not yet committed by `group`.
    pub fn lag(&self, group: &str, topic: Topic) -> u64 {
        let published = self.published(topic).len() as u64;
        published.saturating_sub(self.committed_offset(group, topic))
    }
}

impl Producer for InMemoryBroker {
    type Error = InMemoryBusError;

    fn emit(&self, envelope: EventEnvelope) -> Result<(), Self::Error> {
        let mut state = self.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }
        state.logs.entry(envelope.topic()).or_default().push(envelope);
        drop(state);
        self.inner.appended.notify_all();
        Ok(())
    }
}

impl EventBus for InMemoryBroker {
    type Consumer = InMemoryConsumer;

    fn subscribe(&self, group: &str, topic: Topic) -> Result<Self::Consumer, Self::Error> {
        self.lock()?
            .cursors
            .entry((group.to_string(), topic))
            .or_default();

        Ok(InMemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            topic,
        })
    }
}

/// Sequential reader over one topic log.
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    topic: Topic,
}

impl Consumer for InMemoryConsumer {
    type Error = InMemoryBusError;

    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, Self::Error> {
        let deadline = Instant::now() + timeout;
        let key = (self.group.clone(), self.topic);
        let mut state = self.broker.lock()?;

        loop {
            if !state.available {
                return Err(InMemoryBusError::Unavailable);
            }

            let next = state
                .cursors
                .get(&key)
                .map(|c| c.committed)
                .unwrap_or(0);
            let entry = state
                .logs
                .get(&self.topic)
                .and_then(|log| log.get(next as usize))
                .cloned();

            if let Some(envelope) = entry {
                let cursor = state.cursors.entry(key).or_default();
                cursor.deliveries += 1;
                return Ok(Some(Delivery {
                    envelope,
                    tag: DeliveryTag::Offset(next),
                    attempt: cursor.deliveries,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (guard, _) = self
                .broker
                .inner
                .appended
                .wait_timeout(state, deadline - now)
                .map_err(|_| InMemoryBusError::Poisoned)?;
            state = guard;
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), Self::Error> {
        let offset = match &delivery.tag {
            DeliveryTag::Offset(o) => *o,
            other => return Err(InMemoryBusError::ForeignTag(other.clone())),
        };

        let mut state = self.broker.lock()?;
        if !state.available {
            return Err(InMemoryBusError::Unavailable);
        }

        let cursor = state
            .cursors
            .entry((self.group.clone(), self.topic))
            .or_default();
        // Stale commits (after a rewind or a duplicate) are no-ops.
        if offset >= cursor.committed {
            cursor.committed = offset + 1;
            cursor.deliveries = 0;
        }
        Ok(())
    }

    fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    const GROUP: &str = "order-service";
    const TICK: Duration = Duration::from_millis(20);

    fn envelope(topic: Topic, n: u8) -> EventEnvelope {
        EventEnvelope::new(Uuid::now_v7(), topic, "Test", vec![n], Utc::now())
    }

    #[test]
    fn uncommitted_message_is_redelivered() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(GROUP, Topic::OrderPlaced).unwrap();
        broker.emit(envelope(Topic::OrderPlaced, 1)).unwrap();

        let first = consumer.fetch(TICK).unwrap().unwrap();
        let again = consumer.fetch(TICK).unwrap().unwrap();
        assert_eq!(first.envelope, again.envelope);
        assert_eq!(first.attempt, 1);
        assert_eq!(again.attempt, 2);

        consumer.commit(&again).unwrap();
        assert!(consumer.fetch(TICK).unwrap().is_none());
    }

    #[test]
    fn messages_arrive_in_publish_order_per_topic() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(GROUP, Topic::ProductCreated).unwrap();
        for n in 0..5 {
            broker.emit(envelope(Topic::ProductCreated, n)).unwrap();
        }
        broker.emit(envelope(Topic::OrderPlaced, 99)).unwrap();

        let mut seen = Vec::new();
        while let Some(d) = consumer.fetch(TICK).unwrap() {
            seen.push(d.envelope.payload()[0]);
            consumer.commit(&d).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn groups_track_offsets_independently() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("a", Topic::UserRegistered).unwrap();
        let mut b = broker.subscribe("b", Topic::UserRegistered).unwrap();
        broker.emit(envelope(Topic::UserRegistered, 1)).unwrap();

        let da = a.fetch(TICK).unwrap().unwrap();
        a.commit(&da).unwrap();

        assert_eq!(broker.committed_offset("a", Topic::UserRegistered), 1);
        assert_eq!(broker.lag("b", Topic::UserRegistered), 1);
        assert!(b.fetch(TICK).unwrap().is_some());
    }

    #[test]
    fn rewind_replays_committed_messages() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(GROUP, Topic::OrderPlaced).unwrap();
        broker.emit(envelope(Topic::OrderPlaced, 7)).unwrap();

        let d = consumer.fetch(TICK).unwrap().unwrap();
        consumer.commit(&d).unwrap();
        broker.rewind(GROUP, Topic::OrderPlaced, 0).unwrap();

        let replayed = consumer.fetch(TICK).unwrap().unwrap();
        assert_eq!(replayed.envelope, d.envelope);
    }

    #[test]
    fn unavailable_broker_rejects_emit_and_fetch() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(GROUP, Topic::OrderPlaced).unwrap();
        broker.set_available(false).unwrap();

        assert_eq!(
            broker.emit(envelope(Topic::OrderPlaced, 1)),
            Err(InMemoryBusError::Unavailable)
        );
        assert_eq!(consumer.fetch(TICK), Err(InMemoryBusError::Unavailable));

        broker.set_available(true).unwrap();
        assert!(broker.emit(envelope(Topic::OrderPlaced, 1)).is_ok());
    }

    #[test]
    fn fetch_wakes_up_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(GROUP, Topic::OrderPlaced).unwrap();

        let publisher = broker.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            publisher.emit(envelope(Topic::OrderPlaced, 1)).unwrap();
        });

        let got = consumer.fetch(Duration::from_secs(2)).unwrap();
        t.join().unwrap();
        assert!(got.is_some());
    }
}
