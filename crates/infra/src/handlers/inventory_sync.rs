use tracing::{debug, error, info, instrument};

use storefront_events::{EventHandler, HandlerError, OrderPlaced};

use super::store_failure;
use crate::store::{DeductionApplied, InventoryStore};

/// Applies placed orders to authoritative stock in the product service.
///
/// Deductions, the processed-order ledger entry and the resulting
/// `ProductInventoryUpdated` outbox rows commit together, so a redelivered
/// `OrderPlaced` never deducts twice. Lines that real-time stock can no longer
/// cover are recorded as shortfalls; the order itself is not revisited.
#[derive(Debug, Clone)]
pub struct InventorySyncHandler<S> {
    store: S,
}

impl<S: InventoryStore> InventorySyncHandler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self, event), fields(order_id = %event.order_id), err)]
    pub fn apply(&self, event: &OrderPlaced) -> Result<DeductionApplied, HandlerError> {
        // A blank order id would claim one shared ledger key.
        if !event.order_id.is_valid() {
            return Err(HandlerError::rejected("OrderPlaced without order id"));
        }
        if event.items.iter().any(|l| !l.product_id.is_valid()) {
            return Err(HandlerError::rejected(format!(
                "order {} has a line without product id",
                event.order_id
            )));
        }
        if event.items.is_empty() {
            return Err(HandlerError::rejected(format!("order {} has no items", event.order_id)));
        }
        if let Some(line) = event.items.iter().find(|l| l.quantity == 0) {
            return Err(HandlerError::rejected(format!(
                "order {} has zero quantity for {}",
                event.order_id, line.product_id
            )));
        }

        let applied = self.store.apply_order(event).map_err(store_failure)?;
        match &applied {
            DeductionApplied::Applied(report) => {
                for shortfall in report.shortfalls() {
                    error!(
                        order_id = %shortfall.order_id,
                        product_id = %shortfall.product_id,
                        requested = shortfall.requested,
                        available = shortfall.available,
                        error = %shortfall,
                        "inventory shortfall"
                    );
                }
                info!(
                    lines = report.outcomes.len(),
                    deducted = report.deducted().count(),
                    "order applied to inventory"
                );
            }
            DeductionApplied::AlreadyProcessed(_) => {
                debug!("order already applied, skipping");
            }
        }
        Ok(applied)
    }
}

impl<S: InventoryStore + 'static> EventHandler<OrderPlaced> for InventorySyncHandler<S> {
    fn handle(&self, event: OrderPlaced) -> Result<(), HandlerError> {
        self.apply(&event).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use storefront_core::{OrderId, ProductId, UserId};
    use storefront_events::OrderLine;
    use storefront_products::CreateProduct;

    use crate::outbox::OutboxRecord;
    use crate::store::InMemoryProductDb;

    fn db_with(stock: u32) -> Arc<InMemoryProductDb> {
        let db = Arc::new(InMemoryProductDb::new());
        let product = CreateProduct {
            product_id: ProductId::parse("p1").unwrap(),
            name: "Desk".into(),
            price: 100.0,
            inventory_count: stock,
        }
        .into_product(Utc::now())
        .unwrap();
        let row = OutboxRecord::for_event(&product.created_event()).unwrap();
        db.create_product(&product, &row).unwrap();
        db
    }

    fn order(id: &str, product: &str, quantity: u32) -> OrderPlaced {
        OrderPlaced {
            order_id: OrderId::parse(id).unwrap(),
            user_id: UserId::parse("u1").unwrap(),
            items: vec![OrderLine {
                product_id: ProductId::parse(product).unwrap(),
                quantity,
            }],
        }
    }

    #[test]
    fn second_delivery_is_a_no_op() {
        let db = db_with(5);
        let handler = InventorySyncHandler::new(db.clone());

        assert!(matches!(
            handler.apply(&order("o1", "p1", 2)).unwrap(),
            DeductionApplied::Applied(_)
        ));
        assert!(matches!(
            handler.apply(&order("o1", "p1", 2)).unwrap(),
            DeductionApplied::AlreadyProcessed(_)
        ));

        let product = db.get_product(&ProductId::parse("p1").unwrap()).unwrap().unwrap();
        assert_eq!(product.inventory_count, 3);
    }

    #[test]
    fn shortfall_is_recorded_without_going_negative() {
        let db = db_with(1);
        let handler = InventorySyncHandler::new(db.clone());

        let applied = handler.apply(&order("o1", "p1", 3)).unwrap();
        assert!(!applied.report().is_complete());

        let product = db.get_product(&ProductId::parse("p1").unwrap()).unwrap().unwrap();
        assert_eq!(product.inventory_count, 1);
        assert_eq!(db.shortfalls().unwrap().len(), 1);
    }

    #[test]
    fn unknown_product_is_retried() {
        let handler = InventorySyncHandler::new(db_with(1));
        let err = handler.apply(&order("o1", "ghost", 1)).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn blank_order_id_is_rejected_before_touching_the_ledger() {
        let db = db_with(5);
        let handler = InventorySyncHandler::new(db.clone());
        let foreign: OrderPlaced = serde_json::from_value(serde_json::json!({
            "order_id": "",
            "user_id": "u1",
            "items": [{ "product_id": "p1", "quantity": 1 }]
        }))
        .unwrap();

        let err = handler.apply(&foreign).unwrap_err();
        assert!(!err.is_retryable());
        assert!(db.processed_order(&foreign.order_id).unwrap().is_none());
        assert_eq!(db.get_product(&ProductId::parse("p1").unwrap()).unwrap().unwrap().inventory_count, 5);

        // A later, well-formed order is unaffected.
        assert!(matches!(
            handler.apply(&order("o2", "p1", 1)).unwrap(),
            DeductionApplied::Applied(_)
        ));
    }

    #[test]
    fn blank_product_id_is_rejected_not_retried() {
        let handler = InventorySyncHandler::new(db_with(5));
        let foreign: OrderPlaced = serde_json::from_value(serde_json::json!({
            "order_id": "o1",
            "user_id": "u1",
            "items": [{ "product_id": "  ", "quantity": 1 }]
        }))
        .unwrap();

        assert!(!handler.apply(&foreign).unwrap_err().is_retryable());
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let handler = InventorySyncHandler::new(db_with(1));
        let err = handler.apply(&order("o1", "p1", 0)).unwrap_err();
        assert!(!err.is_retryable());
    }
}
