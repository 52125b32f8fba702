use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use storefront_events::{DeadLetterSink, Event, EventBus, EventHandler, EventRegistry};

use crate::workers::{SubscriptionConfig, SubscriptionWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The handler's event kind is not part of this service's registry.
    #[error("{event} is not registered for this service")]
    NotRegistered { event: &'static str },

    #[error("broker subscription failed: {0}")]
    Bus(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Binds handlers to subscriptions for one consumer group.
///
/// Every `subscribe` call starts its own sequential worker; different topics
/// progress independently.
#[derive(Debug, Clone)]
pub struct ConsumerManager<B, D> {
    bus: B,
    registry: Arc<EventRegistry>,
    group: String,
    dead_letters: D,
    config: SubscriptionConfig,
}

impl<B, D> ConsumerManager<B, D>
where
    B: EventBus,
    D: DeadLetterSink + Clone + 'static,
{
    pub fn new(bus: B, registry: EventRegistry, group: impl Into<String>, dead_letters: D) -> Self {
        Self {
            bus,
            registry: Arc::new(registry),
            group: group.into(),
            dead_letters,
            config: SubscriptionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Subscribe the group to `E`'s topic and start a worker feeding `handler`.
    pub fn subscribe<E, H>(&self, handler: H) -> Result<WorkerHandle, SubscribeError>
    where
        E: Event,
        H: EventHandler<E>,
    {
        if !self.registry.is_registered::<E>() {
            return Err(SubscribeError::NotRegistered { event: E::NAME });
        }

        let consumer = self
            .bus
            .subscribe(&self.group, E::TOPIC)
            .map_err(|e| SubscribeError::Bus(e.to_string()))?;

        let handle = SubscriptionWorker::<E>::spawn(
            &self.group,
            consumer,
            self.registry.clone(),
            handler,
            self.dead_letters.clone(),
            self.config.clone(),
        )?;

        info!(group = %self.group, topic = %E::TOPIC, event = E::NAME, "subscription started");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_events::{
        HandlerError, InMemoryBroker, InMemoryDeadLetterSink, OrderPlaced, UserRegistered,
    };

    #[test]
    fn unregistered_event_cannot_be_subscribed() {
        let registry = EventRegistry::builder().register::<UserRegistered>().build();
        let manager = ConsumerManager::new(
            InMemoryBroker::new(),
            registry,
            "order-service",
            Arc::new(InMemoryDeadLetterSink::new()),
        );

        let err = manager
            .subscribe::<OrderPlaced, _>(|_e: OrderPlaced| -> Result<(), HandlerError> { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, SubscribeError::NotRegistered { event: "OrderPlaced" }));
    }
}
