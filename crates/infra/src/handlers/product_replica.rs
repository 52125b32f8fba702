use tracing::debug;

use storefront_events::{EventHandler, HandlerError, ProductCreated, ProductInventoryUpdated};

use super::store_failure;
use crate::store::ProductReplicaStore;

/// Keeps the order service's product replica current.
///
/// Creation and inventory updates travel on different topics, so either may
/// arrive first; the store merges them.
#[derive(Debug, Clone)]
pub struct ProductReplicaHandler<S> {
    store: S,
}

impl<S> ProductReplicaHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: ProductReplicaStore + 'static> EventHandler<ProductCreated> for ProductReplicaHandler<S> {
    fn handle(&self, event: ProductCreated) -> Result<(), HandlerError> {
        if !event.product_id.is_valid() {
            return Err(HandlerError::rejected("ProductCreated without product id"));
        }
        if !event.price.is_finite() || event.price < 0.0 {
            return Err(HandlerError::rejected(format!(
                "product {} has invalid price {}",
                event.product_id, event.price
            )));
        }
        self.store.upsert_listing(&event).map_err(store_failure)?;
        debug!(product_id = %event.product_id, "product listing replicated");
        Ok(())
    }
}

impl<S: ProductReplicaStore + 'static> EventHandler<ProductInventoryUpdated>
    for ProductReplicaHandler<S>
{
    fn handle(&self, event: ProductInventoryUpdated) -> Result<(), HandlerError> {
        if !event.product_id.is_valid() {
            return Err(HandlerError::rejected("ProductInventoryUpdated without product id"));
        }
        self.store.upsert_inventory(&event).map_err(store_failure)?;
        debug!(
            product_id = %event.product_id,
            inventory_count = event.inventory_count,
            "product inventory replicated"
        );
        Ok(())
    }
}
