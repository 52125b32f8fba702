use thiserror::Error;

use crate::event::Event;

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Try again later: the store is unavailable, or a referenced entity has
    /// not arrived yet. The message stays uncommitted.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The event can never be applied. The message is dead-lettered.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// Applies one concrete event kind.
///
/// Handlers run under at-least-once delivery and must be idempotent: applying
/// the same event twice converges to the same state as applying it once.
pub trait EventHandler<E: Event>: Send + 'static {
    fn handle(&self, event: E) -> Result<(), HandlerError>;
}

impl<E, F> EventHandler<E> for F
where
    E: Event,
    F: Fn(E) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&self, event: E) -> Result<(), HandlerError> {
        self(event)
    }
}
