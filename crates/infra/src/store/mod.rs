//! Per-service transactional stores.
//!
//! Each service owns its own database; nothing is shared across services.
//!
//! - order service: orders, user and product replicas, outbox
//! - product service: authoritative products, processed-order ledger, outbox
//!
//! Every trait has an in-memory implementation (tests/dev) and a Postgres one.
//! Writes that must publish an event take the outbox rows as part of the same
//! call, and the implementation commits both in one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use storefront_core::{OrderId, ProductId, UserId};
use storefront_events::{
    OrderPlaced, ProductCreated, ProductInventoryUpdated, UserProfileUpdated, UserRegistered,
};
use storefront_orders::Order;
use storefront_products::{ConcurrencyError, DeductionReport, Product};

use crate::outbox::OutboxRecord;

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryOrderDb, InMemoryProductDb};
pub use postgres::{PostgresOrderDb, PostgresProductDb};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Connection, pool or server failure. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row the operation depends on does not exist (yet).
    #[error("referenced row missing: {0}")]
    MissingReference(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Stored data could not be mapped back into domain types.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("failed to encode outbox payload: {0}")]
    Encode(String),
}

impl StoreError {
    /// Whether repeating the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::MissingReference(_))
    }
}

/// Locally cached copy of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReplica {
    pub user_id: UserId,
    pub email: String,
    pub phone_no: String,
    /// `updated_at` of the last applied profile change, if any.
    pub profile_updated_at: Option<DateTime<Utc>>,
}

/// Catalog fields known once `ProductCreated` has been seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDetails {
    pub name: String,
    pub price: f64,
}

/// Locally cached copy of a product.
///
/// `details` is `None` when only inventory updates have arrived so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductReplica {
    pub product_id: ProductId,
    pub details: Option<ProductDetails>,
    pub inventory_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Result of applying an `OrderPlaced` against authoritative stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductionApplied {
    /// First application; stock and outbox were updated.
    Applied(DeductionReport),
    /// The order was already in the ledger; nothing changed.
    AlreadyProcessed(DeductionReport),
}

impl DeductionApplied {
    pub fn report(&self) -> &DeductionReport {
        match self {
            DeductionApplied::Applied(r) | DeductionApplied::AlreadyProcessed(r) => r,
        }
    }
}

/// Replica of the user service's users.
pub trait UserReplicaStore: Send + Sync {
    /// Insert if absent; an existing row only has blank fields filled in.
    fn upsert_user(&self, event: &UserRegistered) -> Result<(), StoreError>;

    /// Patch present fields, creating the row if needed. Updates older than the
    /// last applied one are ignored.
    fn apply_profile_update(&self, event: &UserProfileUpdated) -> Result<(), StoreError>;

    fn user_replica(&self, user_id: &UserId) -> Result<Option<UserReplica>, StoreError>;
}

/// Replica of the product service's catalog and stock levels.
pub trait ProductReplicaStore: Send + Sync {
    /// Create the row, or fill in name/price while keeping the current count.
    fn upsert_listing(&self, event: &ProductCreated) -> Result<(), StoreError>;

    /// Create-or-update the inventory count.
    fn upsert_inventory(&self, event: &ProductInventoryUpdated) -> Result<(), StoreError>;

    fn product_replica(&self, product_id: &ProductId) -> Result<Option<ProductReplica>, StoreError>;
}

/// Orders owned by the order service.
pub trait OrderStore: Send + Sync {
    /// Persist the order, its items and `outbox` rows atomically.
    fn insert_order(&self, order: &Order, outbox: &[OutboxRecord]) -> Result<(), StoreError>;

    fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError>;

    /// All orders, newest first.
    fn list_orders(&self) -> Result<Vec<Order>, StoreError>;
}

/// Unsent events co-committed with domain changes.
pub trait OutboxStore: Send + Sync {
    /// Unsent rows, oldest first.
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError>;
}

/// Authoritative products and stock (product service).
pub trait InventoryStore: Send + Sync {
    /// Insert a new product together with its outbox row. Existing ids fail with `Duplicate`.
    fn create_product(&self, product: &Product, outbox: &OutboxRecord) -> Result<(), StoreError>;

    /// Overwrite the stock level.
    ///
    /// The `ProductInventoryUpdated` outbox row is built inside the same
    /// transaction from the written count, so outbox order follows commit
    /// order for the product.
    fn set_inventory(&self, product_id: &ProductId, count: u32) -> Result<Product, StoreError>;

    fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError>;

    /// Apply an order's lines in one transaction.
    ///
    /// - the order id is claimed in the processed ledger first; a second call is a no-op
    /// - each line is a guarded decrement (`count >= quantity`), a failed guard is a shortfall
    /// - every deducted line co-commits a `ProductInventoryUpdated` outbox row
    /// - an unknown product rolls everything back with `MissingReference`
    fn apply_order(&self, order: &OrderPlaced) -> Result<DeductionApplied, StoreError>;

    fn processed_order(&self, order_id: &OrderId) -> Result<Option<DeductionReport>, StoreError>;

    /// Every shortfall recorded so far, oldest first.
    fn shortfalls(&self) -> Result<Vec<ConcurrencyError>, StoreError>;
}

impl<S: UserReplicaStore + ?Sized> UserReplicaStore for Arc<S> {
    fn upsert_user(&self, event: &UserRegistered) -> Result<(), StoreError> {
        (**self).upsert_user(event)
    }

    fn apply_profile_update(&self, event: &UserProfileUpdated) -> Result<(), StoreError> {
        (**self).apply_profile_update(event)
    }

    fn user_replica(&self, user_id: &UserId) -> Result<Option<UserReplica>, StoreError> {
        (**self).user_replica(user_id)
    }
}

impl<S: ProductReplicaStore + ?Sized> ProductReplicaStore for Arc<S> {
    fn upsert_listing(&self, event: &ProductCreated) -> Result<(), StoreError> {
        (**self).upsert_listing(event)
    }

    fn upsert_inventory(&self, event: &ProductInventoryUpdated) -> Result<(), StoreError> {
        (**self).upsert_inventory(event)
    }

    fn product_replica(&self, product_id: &ProductId) -> Result<Option<ProductReplica>, StoreError> {
        (**self).product_replica(product_id)
    }
}

impl<S: OrderStore + ?Sized> OrderStore for Arc<S> {
    fn insert_order(&self, order: &Order, outbox: &[OutboxRecord]) -> Result<(), StoreError> {
        (**self).insert_order(order, outbox)
    }

    fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        (**self).get_order(order_id)
    }

    fn list_orders(&self) -> Result<Vec<Order>, StoreError> {
        (**self).list_orders()
    }
}

impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        (**self).fetch_unsent(limit)
    }

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).mark_sent(id, at)
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        (**self).record_failure(id, error)
    }
}

impl<S: InventoryStore + ?Sized> InventoryStore for Arc<S> {
    fn create_product(&self, product: &Product, outbox: &OutboxRecord) -> Result<(), StoreError> {
        (**self).create_product(product, outbox)
    }

    fn set_inventory(&self, product_id: &ProductId, count: u32) -> Result<Product, StoreError> {
        (**self).set_inventory(product_id, count)
    }

    fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError> {
        (**self).get_product(product_id)
    }

    fn apply_order(&self, order: &OrderPlaced) -> Result<DeductionApplied, StoreError> {
        (**self).apply_order(order)
    }

    fn processed_order(&self, order_id: &OrderId) -> Result<Option<DeductionReport>, StoreError> {
        (**self).processed_order(order_id)
    }

    fn shortfalls(&self) -> Result<Vec<ConcurrencyError>, StoreError> {
        (**self).shortfalls()
    }
}
