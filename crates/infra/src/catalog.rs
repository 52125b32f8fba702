//! Product catalog commands (product service).
//!
//! These are the producers of `ProductCreated` and `ProductInventoryUpdated`:
//! each write co-commits the event in the outbox.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use storefront_core::{DomainError, ProductId};
use storefront_products::{ConcurrencyError, CreateProduct, Product};

use crate::outbox::OutboxRecord;
use crate::store::{InventoryStore, StoreError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("infrastructure error: {0}")]
    Infra(StoreError),
}

impl From<DomainError> for CatalogError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound(what) => CatalogError::NotFound(what),
            other => CatalogError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => CatalogError::Duplicate(what),
            StoreError::MissingReference(what) => CatalogError::NotFound(what),
            other => CatalogError::Infra(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductCatalogService<S> {
    store: S,
}

impl<S: InventoryStore> ProductCatalogService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[instrument(skip(self, command), fields(product_id = %command.product_id), err)]
    pub fn create_product(&self, command: CreateProduct) -> Result<Product, CatalogError> {
        let product = command.into_product(Utc::now())?;
        let outbox = OutboxRecord::for_event(&product.created_event()).map_err(StoreError::from)?;
        self.store.create_product(&product, &outbox)?;
        info!(inventory_count = product.inventory_count, "product created");
        Ok(product)
    }

    /// Overwrite the stock level (restock or manual correction).
    #[instrument(skip(self), err)]
    pub fn set_inventory(&self, product_id: &ProductId, count: u32) -> Result<Product, CatalogError> {
        let product = self.store.set_inventory(product_id, count)?;
        info!(inventory_count = count, "inventory set");
        Ok(product)
    }

    pub fn get_product(&self, product_id: &ProductId) -> Result<Product, CatalogError> {
        self.store
            .get_product(product_id)?
            .ok_or_else(|| CatalogError::NotFound(format!("product {product_id}")))
    }

    /// Order lines real-time stock could not cover, oldest first.
    pub fn shortfalls(&self) -> Result<Vec<ConcurrencyError>, CatalogError> {
        Ok(self.store.shortfalls()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use storefront_events::Topic;

    use crate::store::{InMemoryProductDb, OutboxStore};

    fn lamp() -> CreateProduct {
        CreateProduct {
            product_id: ProductId::parse("lamp").unwrap(),
            name: "Lamp".into(),
            price: 12.0,
            inventory_count: 4,
        }
    }

    #[test]
    fn create_then_restock_queues_both_events() {
        let db = Arc::new(InMemoryProductDb::new());
        let catalog = ProductCatalogService::new(db.clone());

        catalog.create_product(lamp()).unwrap();
        let product = catalog
            .set_inventory(&ProductId::parse("lamp").unwrap(), 9)
            .unwrap();
        assert_eq!(product.inventory_count, 9);

        let topics: Vec<Topic> = db.fetch_unsent(10).unwrap().iter().map(|r| r.topic).collect();
        assert_eq!(topics, vec![Topic::ProductCreated, Topic::ProductInventoryUpdated]);
    }

    #[test]
    fn duplicate_product_is_reported() {
        let catalog = ProductCatalogService::new(Arc::new(InMemoryProductDb::new()));
        catalog.create_product(lamp()).unwrap();
        assert!(matches!(catalog.create_product(lamp()), Err(CatalogError::Duplicate(_))));
    }

    #[test]
    fn invalid_price_is_rejected() {
        let catalog = ProductCatalogService::new(Arc::new(InMemoryProductDb::new()));
        let err = catalog
            .create_product(CreateProduct {
                price: -3.0,
                ..lamp()
            })
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
    }

    #[test]
    fn restocking_unknown_product_is_not_found() {
        let catalog = ProductCatalogService::new(Arc::new(InMemoryProductDb::new()));
        let err = catalog
            .set_inventory(&ProductId::parse("ghost").unwrap(), 1)
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
