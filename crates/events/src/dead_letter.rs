//! Diversion path for messages a subscription cannot process.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::envelope::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The envelope could not be decoded for this service.
    Decode(String),
    /// The handler rejected the event permanently.
    Rejected(String),
}

impl DeadLetterReason {
    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterReason::Decode(_) => "decode",
            DeadLetterReason::Rejected(_) => "rejected",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            DeadLetterReason::Decode(d) | DeadLetterReason::Rejected(d) => d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub envelope: EventEnvelope,
    pub group: String,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Operator-visible sink for dead letters.
pub trait DeadLetterSink: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn divert(&self, letter: DeadLetter) -> Result<(), Self::Error>;
}

impl<S> DeadLetterSink for Arc<S>
where
    S: DeadLetterSink + ?Sized,
{
    type Error = S::Error;

    fn divert(&self, letter: DeadLetter) -> Result<(), Self::Error> {
        (**self).divert(letter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dead-letter sink lock poisoned")]
pub struct SinkPoisoned;

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    type Error = SinkPoisoned;

    fn divert(&self, letter: DeadLetter) -> Result<(), Self::Error> {
        self.letters.lock().map_err(|_| SinkPoisoned)?.push(letter);
        Ok(())
    }
}
