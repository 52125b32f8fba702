use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use storefront_events::Producer;

use crate::managers::ProducerManager;
use crate::store::{OutboxStore, StoreError};
use crate::workers::{SharedStats, WorkerHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub name: String,
    /// Pause between polls when the outbox is drained or blocked.
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            poll_interval: Duration::from_millis(200),
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// What one pass over the outbox achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    /// Row the pass stopped at because the broker refused it.
    pub blocked_on: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),
}

/// Publishes unsent outbox rows in creation order.
///
/// A row is marked sent only after the broker acknowledged it. On the first
/// refusal the pass stops, so later rows never overtake an earlier one on the
/// same topic. A crash between publish and `mark_sent` re-publishes the row
/// under the same event id.
#[derive(Debug)]
pub struct OutboxRelay<S, P> {
    store: S,
    producer: ProducerManager<P>,
    config: RelayConfig,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore + 'static,
    P: Producer + 'static,
{
    pub fn new(store: S, producer: P, config: RelayConfig) -> Self {
        Self {
            store,
            producer: ProducerManager::new(producer),
            config,
        }
    }

    #[instrument(skip(self), fields(relay = %self.config.name), err)]
    pub fn relay_once(&self) -> Result<RelayReport, RelayError> {
        let rows = self.store.fetch_unsent(self.config.batch_size)?;
        let mut report = RelayReport::default();

        for row in rows {
            match self.producer.emit_envelope(row.to_envelope()) {
                Ok(()) => {
                    self.store.mark_sent(row.id, Utc::now())?;
                    report.published += 1;
                }
                Err(err) => {
                    warn!(
                        outbox_id = %row.id,
                        event_name = %row.event_name,
                        attempts = row.attempts + 1,
                        error = %err,
                        "publish failed, outbox row stays unsent"
                    );
                    if let Err(store_err) = self.store.record_failure(row.id, &err.to_string()) {
                        warn!(outbox_id = %row.id, error = %store_err, "failed to record publish failure");
                    }
                    report.blocked_on = Some(row.id);
                    break;
                }
            }
        }

        if report.published > 0 {
            debug!(published = report.published, "outbox rows relayed");
        }
        Ok(report)
    }

    /// Run `relay_once` on a background thread until shut down.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = SharedStats::default();
        let thread_stats = stats.clone();
        let name = self.config.name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(shutdown_rx, thread_stats))?;

        Ok(WorkerHandle::new(name, shutdown_tx, join, stats))
    }

    fn run(self, shutdown_rx: mpsc::Receiver<()>, stats: SharedStats) {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let drained = match self.relay_once() {
                Ok(report) => {
                    stats.update(|s| s.processed += report.published as u64);
                    if report.blocked_on.is_some() {
                        stats.update(|s| s.broker_errors += 1);
                    }
                    report.blocked_on.is_some() || report.published < self.config.batch_size
                }
                Err(err) => {
                    warn!(relay = %self.config.name, error = %err, "outbox relay pass failed");
                    true
                }
            };

            if !drained {
                continue;
            }

            match shutdown_rx.recv_timeout(self.config.poll_interval) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(self.config.poll_interval),
            }
        }
    }
}
