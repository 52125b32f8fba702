//! Per-service subscription wiring.
//!
//! Each service declares the events it consumes in its own registry and binds
//! one handler per topic. Registries are built here once and never mutated.

use storefront_events::{
    DeadLetterSink, EventBus, EventRegistry, OrderPlaced, ProductCreated, ProductInventoryUpdated,
    UserProfileUpdated, UserRegistered,
};

use crate::handlers::{InventorySyncHandler, ProductReplicaHandler, UserReplicaHandler};
use crate::managers::{ConsumerManager, SubscribeError};
use crate::store::{InventoryStore, ProductReplicaStore, UserReplicaStore};
use crate::workers::{SubscriptionConfig, WorkerHandle, shutdown_all};

pub const ORDER_SERVICE_GROUP: &str = "order-service";
pub const PRODUCT_SERVICE_GROUP: &str = "product-service";

/// Events the order service keeps replicas from.
pub fn order_service_registry() -> EventRegistry {
    EventRegistry::builder()
        .register::<UserRegistered>()
        .register::<UserProfileUpdated>()
        .register::<ProductCreated>()
        .register::<ProductInventoryUpdated>()
        .build()
}

/// Events the product service reacts to.
pub fn product_service_registry() -> EventRegistry {
    EventRegistry::builder().register::<OrderPlaced>().build()
}

/// Start the order service's four replica subscriptions.
///
/// On failure, workers already started are shut down before returning.
pub fn spawn_order_service_consumers<B, D, S>(
    bus: B,
    group: &str,
    store: S,
    dead_letters: D,
    config: SubscriptionConfig,
) -> Result<Vec<WorkerHandle>, SubscribeError>
where
    B: EventBus,
    D: DeadLetterSink + Clone + 'static,
    S: UserReplicaStore + ProductReplicaStore + Clone + 'static,
{
    let manager = ConsumerManager::new(bus, order_service_registry(), group, dead_letters)
        .with_config(config);
    let users = UserReplicaHandler::new(store.clone());
    let products = ProductReplicaHandler::new(store);

    let mut workers = Vec::with_capacity(4);
    let started = (|| {
        workers.push(manager.subscribe::<UserRegistered, _>(users.clone())?);
        workers.push(manager.subscribe::<UserProfileUpdated, _>(users)?);
        workers.push(manager.subscribe::<ProductCreated, _>(products.clone())?);
        workers.push(manager.subscribe::<ProductInventoryUpdated, _>(products)?);
        Ok::<(), SubscribeError>(())
    })();

    match started {
        Ok(()) => Ok(workers),
        Err(err) => {
            shutdown_all(workers);
            Err(err)
        }
    }
}

/// Start the product service's inventory sync subscription.
pub fn spawn_product_service_consumers<B, D, S>(
    bus: B,
    group: &str,
    store: S,
    dead_letters: D,
    config: SubscriptionConfig,
) -> Result<Vec<WorkerHandle>, SubscribeError>
where
    B: EventBus,
    D: DeadLetterSink + Clone + 'static,
    S: InventoryStore + 'static,
{
    let manager = ConsumerManager::new(bus, product_service_registry(), group, dead_letters)
        .with_config(config);
    let worker = manager.subscribe::<OrderPlaced, _>(InventorySyncHandler::new(store))?;
    Ok(vec![worker])
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_events::Topic;

    #[test]
    fn registries_are_disjoint_by_service() {
        let order = order_service_registry();
        assert!(order.is_registered::<UserProfileUpdated>());
        assert!(!order.is_registered::<OrderPlaced>());
        assert_eq!(order.expected_event(Topic::ProductCreated), Some("ProductCreated"));

        let product = product_service_registry();
        assert_eq!(product.topics().collect::<Vec<_>>(), vec![Topic::OrderPlaced]);
    }
}
