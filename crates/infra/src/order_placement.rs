//! Order placement workflow (order service).

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use storefront_core::{DomainError, OrderId};
use storefront_orders::{Order, OrderItem, PlaceOrder};

use crate::outbox::OutboxRecord;
use crate::store::{OrderStore, ProductReplicaStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlaceOrderError {
    /// Malformed command or insufficient advisory stock.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("infrastructure error: {0}")]
    Infra(#[from] StoreError),
}

impl From<DomainError> for PlaceOrderError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(what) => PlaceOrderError::NotFound(what),
            other => PlaceOrderError::Validation(other.to_string()),
        }
    }
}

/// Places orders against the local product replica.
///
/// The stock check is advisory: nothing is reserved, and the product service
/// settles the real deduction when it consumes `OrderPlaced`.
#[derive(Debug, Clone)]
pub struct OrderPlacementService<S> {
    store: S,
}

impl<S> OrderPlacementService<S>
where
    S: ProductReplicaStore + OrderStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Validate, price and persist an order together with its `OrderPlaced` outbox row.
    #[instrument(skip(self, command), fields(user_id = %command.user_id, lines = command.items.len()), err)]
    pub fn place_order(&self, command: PlaceOrder) -> Result<Order, PlaceOrderError> {
        let lines = command.normalized_lines()?;

        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let replica = self
                .store
                .product_replica(&line.product_id)?
                .ok_or_else(|| PlaceOrderError::NotFound(format!("product {}", line.product_id)))?;
            let details = replica.details.ok_or_else(|| {
                PlaceOrderError::NotFound(format!("product {} has no catalog entry yet", line.product_id))
            })?;

            if replica.inventory_count < line.quantity {
                return Err(PlaceOrderError::Validation(format!(
                    "insufficient stock for {}: requested {}, available {}",
                    line.product_id, line.quantity, replica.inventory_count
                )));
            }

            items.push(OrderItem {
                product_id: line.product_id,
                quantity: line.quantity,
                price_at_order: details.price,
            });
        }

        let order = Order::place(OrderId::generate(), command.user_id, items, Utc::now())?;
        let outbox = OutboxRecord::for_event(&order.placed_event()).map_err(StoreError::from)?;
        self.store.insert_order(&order, std::slice::from_ref(&outbox))?;

        info!(
            order_id = %order.order_id(),
            total_price = order.total_price(),
            event_id = %outbox.id,
            "order placed"
        );
        Ok(order)
    }

    pub fn get_order(&self, order_id: &OrderId) -> Result<Order, PlaceOrderError> {
        self.store
            .get_order(order_id)?
            .ok_or_else(|| PlaceOrderError::NotFound(format!("order {order_id}")))
    }

    /// Newest first.
    pub fn list_orders(&self) -> Result<Vec<Order>, PlaceOrderError> {
        Ok(self.store.list_orders()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use storefront_core::{ProductId, UserId};
    use storefront_events::{ProductCreated, ProductInventoryUpdated, Topic};
    use storefront_orders::{OrderStatus, RequestedLine};

    use crate::store::{InMemoryOrderDb, OutboxStore};

    fn pid(raw: &str) -> ProductId {
        ProductId::parse(raw).unwrap()
    }

    fn db_with_product(id: &str, price: f64, count: u32) -> Arc<InMemoryOrderDb> {
        let db = Arc::new(InMemoryOrderDb::new());
        db.upsert_listing(&ProductCreated {
            product_id: pid(id),
            name: format!("product {id}"),
            price,
            inventory_count: count,
        })
        .unwrap();
        db
    }

    fn command(lines: &[(&str, u32)]) -> PlaceOrder {
        PlaceOrder {
            user_id: UserId::parse("u1").unwrap(),
            items: lines
                .iter()
                .map(|(id, quantity)| RequestedLine {
                    product_id: pid(id),
                    quantity: *quantity,
                })
                .collect(),
        }
    }

    #[test]
    fn places_order_and_queues_event() {
        let db = db_with_product("P100", 2.5, 5);
        let service = OrderPlacementService::new(db.clone());

        let order = service.place_order(command(&[("P100", 3)])).unwrap();
        assert_eq!(order.status(), OrderStatus::Placed);
        assert_eq!(order.total_price(), 7.5);

        let unsent = db.fetch_unsent(10).unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].topic, Topic::OrderPlaced);

        assert_eq!(service.get_order(order.order_id()).unwrap(), order);
    }

    #[test]
    fn duplicate_lines_are_checked_as_one() {
        let db = db_with_product("P100", 1.0, 5);
        let service = OrderPlacementService::new(db.clone());

        let err = service
            .place_order(command(&[("P100", 3), ("P100", 3)]))
            .unwrap_err();
        assert!(matches!(err, PlaceOrderError::Validation(_)));
        assert!(db.list_orders().unwrap().is_empty());
    }

    #[test]
    fn unknown_product_is_not_found() {
        let db = db_with_product("P100", 1.0, 5);
        let service = OrderPlacementService::new(db.clone());

        let err = service.place_order(command(&[("P100", 1), ("P999", 1)])).unwrap_err();
        assert!(matches!(err, PlaceOrderError::NotFound(_)));
        assert!(db.outbox().is_empty());
    }

    #[test]
    fn inventory_only_replica_cannot_be_priced() {
        let db = Arc::new(InMemoryOrderDb::new());
        db.upsert_inventory(&ProductInventoryUpdated {
            product_id: pid("P100"),
            inventory_count: 5,
        })
        .unwrap();
        let service = OrderPlacementService::new(db);

        let err = service.place_order(command(&[("P100", 1)])).unwrap_err();
        assert!(matches!(err, PlaceOrderError::NotFound(_)));
    }

    #[test]
    fn empty_order_is_invalid() {
        let service = OrderPlacementService::new(Arc::new(InMemoryOrderDb::new()));
        let err = service.place_order(command(&[])).unwrap_err();
        assert!(matches!(err, PlaceOrderError::Validation(_)));
    }

    #[test]
    fn store_outage_surfaces_as_infra() {
        let db = db_with_product("P100", 1.0, 5);
        db.set_available(false);
        let service = OrderPlacementService::new(db);

        let err = service.place_order(command(&[("P100", 1)])).unwrap_err();
        assert!(matches!(err, PlaceOrderError::Infra(StoreError::Unavailable(_))));
    }

    #[test]
    fn missing_order_is_not_found() {
        let service = OrderPlacementService::new(Arc::new(InMemoryOrderDb::new()));
        let err = service.get_order(&OrderId::parse("nope").unwrap()).unwrap_err();
        assert!(matches!(err, PlaceOrderError::NotFound(_)));
    }
}
