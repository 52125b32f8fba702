//! Background workers: one thread per subscription, plus the outbox relay.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

pub mod retry;
pub mod subscription_worker;

pub use retry::{BackoffStrategy, RetryPolicy};
pub use subscription_worker::{SubscriptionConfig, SubscriptionWorker};

/// Counters a worker updates as it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages handled and committed.
    pub processed: u64,
    /// Handler failures left uncommitted for redelivery.
    pub retried: u64,
    /// Redeliveries past the retry budget; non-zero means a subscription is stuck.
    pub stalled: u64,
    pub dead_lettered: u64,
    /// Broker fetch/commit failures.
    pub broker_errors: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SharedStats(Arc<Mutex<WorkerStats>>);

impl SharedStats {
    pub(crate) fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.0.lock() {
            f(&mut stats);
        }
    }

    fn snapshot(&self) -> WorkerStats {
        self.0.lock().map(|s| *s).unwrap_or_default()
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
}

impl WorkerHandle {
    pub(crate) fn new(
        name: String,
        shutdown: mpsc::Sender<()>,
        join: thread::JoinHandle<()>,
        stats: SharedStats,
    ) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A message being handled is finished first; nothing is committed after
    /// the loop exits.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Shut down a set of workers, in order.
pub fn shutdown_all(workers: Vec<WorkerHandle>) {
    for worker in workers {
        worker.shutdown();
    }
}
