use std::marker::PhantomData;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use storefront_events::{
    Consumer, DeadLetter, DeadLetterReason, DeadLetterSink, Delivery, Event, EventHandler,
    EventRegistry, HandlerError,
};

use super::{RetryPolicy, SharedStats, WorkerHandle};

/// Tuning for one subscription loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Longest a single `fetch` blocks; also the shutdown check interval.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Handlers running longer than this are logged.
    pub slow_handler_threshold: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            slow_handler_threshold: Duration::from_secs(5),
        }
    }
}

impl SubscriptionConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_slow_handler_threshold(mut self, threshold: Duration) -> Self {
        self.slow_handler_threshold = threshold;
        self
    }
}

/// Sequential fetch → decode → handle → commit loop for one `(group, topic)`.
///
/// - one message is in flight at a time, so per-topic order is preserved
/// - a message is committed only after its handler succeeded, or after it was
///   written to the dead-letter sink
/// - a retryable failure leaves the message uncommitted; the broker hands the
///   same message back after the backoff delay, indefinitely
/// - only decode failures and rejected events are dead-lettered
#[derive(Debug)]
pub struct SubscriptionWorker<E> {
    _event: PhantomData<fn() -> E>,
}

enum Step {
    Commit,
    Redeliver(Duration),
}

struct Loop<E, C, H, D> {
    name: String,
    group: String,
    consumer: C,
    registry: Arc<EventRegistry>,
    handler: H,
    dead_letters: D,
    config: SubscriptionConfig,
    stats: SharedStats,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> SubscriptionWorker<E> {
    /// Spawn the worker thread. The thread is named `{group}:{topic}`.
    pub fn spawn<C, H, D>(
        group: &str,
        consumer: C,
        registry: Arc<EventRegistry>,
        handler: H,
        dead_letters: D,
        config: SubscriptionConfig,
    ) -> std::io::Result<WorkerHandle>
    where
        C: Consumer + 'static,
        H: EventHandler<E>,
        D: DeadLetterSink + 'static,
    {
        let name = format!("{}:{}", group, consumer.topic());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = SharedStats::default();

        let worker = Loop::<E, C, H, D> {
            name: name.clone(),
            group: group.to_string(),
            consumer,
            registry,
            handler,
            dead_letters,
            config,
            stats: stats.clone(),
            _event: PhantomData,
        };

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run(shutdown_rx))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join, stats))
    }
}

/// Sleep up to `delay`, returning `true` if shutdown was requested meanwhile.
fn wait_or_shutdown(shutdown_rx: &mpsc::Receiver<()>, delay: Duration) -> bool {
    match shutdown_rx.recv_timeout(delay) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => false,
        Err(RecvTimeoutError::Disconnected) => {
            thread::sleep(delay);
            false
        }
    }
}

impl<E, C, H, D> Loop<E, C, H, D>
where
    E: Event,
    C: Consumer,
    H: EventHandler<E>,
    D: DeadLetterSink,
{
    fn run(mut self, shutdown_rx: mpsc::Receiver<()>) {
        debug!(worker = %self.name, "subscription worker started");

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let delivery = match self.consumer.fetch(self.config.poll_interval) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "fetch failed");
                    self.stats.update(|s| s.broker_errors += 1);
                    if wait_or_shutdown(&shutdown_rx, self.config.poll_interval) {
                        break;
                    }
                    continue;
                }
            };

            match self.process(&delivery) {
                Step::Commit => {
                    if let Err(err) = self.consumer.commit(&delivery) {
                        // Uncommitted: the message comes back and the handler sees it again.
                        warn!(
                            worker = %self.name,
                            event_id = %delivery.envelope.event_id(),
                            error = %err,
                            "commit failed"
                        );
                        self.stats.update(|s| s.broker_errors += 1);
                        if wait_or_shutdown(&shutdown_rx, self.config.poll_interval) {
                            break;
                        }
                    }
                }
                Step::Redeliver(delay) => {
                    if wait_or_shutdown(&shutdown_rx, delay) {
                        break;
                    }
                }
            }
        }

        debug!(worker = %self.name, "subscription worker stopped");
    }

    fn process(&mut self, delivery: &Delivery) -> Step {
        let envelope = &delivery.envelope;

        let event = match self.registry.decode_as::<E>(envelope) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    worker = %self.name,
                    event_id = %envelope.event_id(),
                    event_name = envelope.event_name(),
                    error = %err,
                    "undecodable message"
                );
                return self.divert(delivery, DeadLetterReason::Decode(err.to_string()));
            }
        };

        let started = Instant::now();
        let result = self.handler.handle(event);
        let elapsed = started.elapsed();
        if elapsed > self.config.slow_handler_threshold {
            warn!(
                worker = %self.name,
                event_id = %envelope.event_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow handler"
            );
        }

        match result {
            Ok(()) => {
                self.stats.update(|s| s.processed += 1);
                Step::Commit
            }
            Err(HandlerError::Rejected(reason)) => {
                error!(
                    worker = %self.name,
                    event_id = %envelope.event_id(),
                    reason = %reason,
                    "handler rejected event"
                );
                self.divert(delivery, DeadLetterReason::Rejected(reason))
            }
            Err(HandlerError::Retryable(reason)) => {
                let delay = self.config.retry.delay_for_attempt(delivery.attempt);
                if self.config.retry.is_exhausted(delivery.attempt) {
                    // Past the budget the message still stays uncommitted; only the alarm changes.
                    error!(
                        worker = %self.name,
                        event_id = %envelope.event_id(),
                        attempt = delivery.attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "retry budget exhausted, subscription stalled on message"
                    );
                    self.stats.update(|s| s.stalled += 1);
                } else {
                    warn!(
                        worker = %self.name,
                        event_id = %envelope.event_id(),
                        attempt = delivery.attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "handler failed, message left for redelivery"
                    );
                }
                self.stats.update(|s| s.retried += 1);
                Step::Redeliver(delay)
            }
        }
    }

    fn divert(&self, delivery: &Delivery, reason: DeadLetterReason) -> Step {
        let letter = DeadLetter {
            envelope: delivery.envelope.clone(),
            group: self.group.clone(),
            reason,
            attempts: delivery.attempt,
            failed_at: Utc::now(),
        };

        match self.dead_letters.divert(letter) {
            Ok(()) => {
                self.stats.update(|s| s.dead_lettered += 1);
                Step::Commit
            }
            Err(err) => {
                // Never commit a message that was neither handled nor parked.
                warn!(worker = %self.name, error = %err, "dead-letter write failed");
                Step::Redeliver(self.config.retry.delay_for_attempt(delivery.attempt.max(1)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use storefront_core::UserId;
    use storefront_events::{
        EventBus, EventEnvelope, InMemoryBroker, InMemoryDeadLetterSink, Producer, Topic,
        UserRegistered,
    };
    use uuid::Uuid;

    fn registry() -> Arc<EventRegistry> {
        Arc::new(EventRegistry::builder().register::<UserRegistered>().build())
    }

    fn user(id: &str) -> UserRegistered {
        UserRegistered {
            user_id: UserId::parse(id).unwrap(),
            email: format!("{id}@example.com"),
            phone_no: "555-0100".into(),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn fast() -> SubscriptionConfig {
        SubscriptionConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    #[test]
    fn commits_after_successful_handling() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("g", Topic::UserRegistered).unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_handler = seen.clone();

        let handle = SubscriptionWorker::<UserRegistered>::spawn(
            "g",
            consumer,
            registry(),
            move |_e: UserRegistered| -> Result<(), HandlerError> {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            InMemoryDeadLetterSink::new(),
            fast(),
        )
        .unwrap();

        broker
            .emit(EventEnvelope::from_event(Uuid::now_v7(), &user("u1")).unwrap())
            .unwrap();

        wait_for(|| broker.committed_offset("g", Topic::UserRegistered) == 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(handle.name(), "g:user-registered");
        assert_eq!(handle.stats().processed, 1);
        handle.shutdown();
    }

    #[test]
    fn retryable_failure_is_never_committed_past_the_budget() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("g", Topic::UserRegistered).unwrap();
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_handler = calls.clone();

        let handle = SubscriptionWorker::<UserRegistered>::spawn(
            "g",
            consumer,
            registry(),
            move |_e: UserRegistered| -> Result<(), HandlerError> {
                // Fails twice past the three-attempt budget, then recovers.
                if calls_in_handler.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(HandlerError::retryable("store down"))
                } else {
                    Ok(())
                }
            },
            sink.clone(),
            fast(),
        )
        .unwrap();

        broker
            .emit(EventEnvelope::from_event(Uuid::now_v7(), &user("u1")).unwrap())
            .unwrap();

        wait_for(|| broker.committed_offset("g", Topic::UserRegistered) == 1);
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(sink.letters().is_empty());
        assert_eq!(stats.retried, 5);
        assert_eq!(stats.stalled, 3);
        assert_eq!(stats.processed, 1);
    }

    #[test]
    fn rejected_event_is_dead_lettered_once() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("g", Topic::UserRegistered).unwrap();
        let sink = Arc::new(InMemoryDeadLetterSink::new());

        let handle = SubscriptionWorker::<UserRegistered>::spawn(
            "g",
            consumer,
            registry(),
            |_e: UserRegistered| -> Result<(), HandlerError> {
                Err(HandlerError::rejected("malformed user"))
            },
            sink.clone(),
            fast(),
        )
        .unwrap();

        broker
            .emit(EventEnvelope::from_event(Uuid::now_v7(), &user("u1")).unwrap())
            .unwrap();

        wait_for(|| broker.committed_offset("g", Topic::UserRegistered) == 1);
        handle.shutdown();

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason.kind(), "rejected");
        assert_eq!(letters[0].attempts, 1);
    }

    #[test]
    fn undecodable_message_is_parked_and_skipped() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("g", Topic::UserRegistered).unwrap();
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_handler = seen.clone();

        let handle = SubscriptionWorker::<UserRegistered>::spawn(
            "g",
            consumer,
            registry(),
            move |_e: UserRegistered| -> Result<(), HandlerError> {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            sink.clone(),
            fast(),
        )
        .unwrap();

        broker
            .emit(EventEnvelope::new(
                Uuid::now_v7(),
                Topic::UserRegistered,
                "UserRegistered",
                b"{not json".to_vec(),
                Utc::now(),
            ))
            .unwrap();
        broker
            .emit(EventEnvelope::from_event(Uuid::now_v7(), &user("u2")).unwrap())
            .unwrap();

        wait_for(|| broker.committed_offset("g", Topic::UserRegistered) == 2);
        handle.shutdown();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(sink.letters()[0].reason.kind(), "decode");
    }

    #[test]
    fn broker_outage_does_not_lose_messages() {
        let broker = InMemoryBroker::new();
        let consumer = broker.subscribe("g", Topic::UserRegistered).unwrap();
        broker
            .emit(EventEnvelope::from_event(Uuid::now_v7(), &user("u1")).unwrap())
            .unwrap();
        broker.set_available(false).unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_handler = seen.clone();
        let handle = SubscriptionWorker::<UserRegistered>::spawn(
            "g",
            consumer,
            registry(),
            move |_e: UserRegistered| -> Result<(), HandlerError> {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            InMemoryDeadLetterSink::new(),
            fast(),
        )
        .unwrap();

        wait_for(|| handle.stats().broker_errors > 0);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        broker.set_available(true).unwrap();
        wait_for(|| broker.committed_offset("g", Topic::UserRegistered) == 1);
        handle.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
