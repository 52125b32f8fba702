//! In-memory stores for tests/dev.
//!
//! One `RwLock` per database stands in for a transaction: every trait method
//! takes the write (or read) lock once, stages its changes, and publishes them
//! only when nothing failed.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use storefront_core::{OrderId, ProductId, UserId};
use storefront_events::{
    OrderPlaced, ProductCreated, ProductInventoryUpdated, UserProfileUpdated, UserRegistered,
};
use storefront_orders::Order;
use storefront_products::{ConcurrencyError, DeductionReport, LineOutcome, Product};

use super::{
    DeductionApplied, InventoryStore, OrderStore, OutboxStore, ProductDetails, ProductReplica,
    ProductReplicaStore, StoreError, UserReplica, UserReplicaStore,
};
use crate::outbox::OutboxRecord;

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

fn offline() -> StoreError {
    StoreError::Unavailable("in-memory store switched off".to_string())
}

/// Rows are appended under the write lock, so vector order is commit order.
fn unsent(outbox: &[OutboxRecord], limit: usize) -> Vec<OutboxRecord> {
    outbox
        .iter()
        .filter(|r| !r.is_sent())
        .take(limit)
        .cloned()
        .collect()
}

fn find_outbox(outbox: &mut [OutboxRecord], id: Uuid) -> Result<&mut OutboxRecord, StoreError> {
    outbox
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| StoreError::MissingReference(format!("outbox row {id}")))
}

/// Simulated availability switch shared by both databases.
#[derive(Debug)]
struct Availability(AtomicBool);

impl Default for Availability {
    fn default() -> Self {
        Self(AtomicBool::new(true))
    }
}

impl Availability {
    fn check(&self) -> Result<(), StoreError> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline())
        }
    }
}

#[derive(Debug, Default)]
struct OrderTables {
    orders: HashMap<OrderId, Order>,
    users: HashMap<UserId, UserReplica>,
    products: HashMap<ProductId, ProductReplica>,
    outbox: Vec<OutboxRecord>,
}

/// Order service database.
#[derive(Debug, Default)]
pub struct InMemoryOrderDb {
    tables: RwLock<OrderTables>,
    availability: Availability,
}

impl InMemoryOrderDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the database going away (every call fails with `Unavailable`).
    pub fn set_available(&self, available: bool) {
        self.availability.0.store(available, Ordering::SeqCst);
    }

    /// Every outbox row, sent or not.
    pub fn outbox(&self) -> Vec<OutboxRecord> {
        self.tables.read().map(|t| t.outbox.clone()).unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, OrderTables>, StoreError> {
        self.availability.check()?;
        self.tables.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, OrderTables>, StoreError> {
        self.availability.check()?;
        self.tables.write().map_err(|_| poisoned())
    }
}

impl UserReplicaStore for InMemoryOrderDb {
    fn upsert_user(&self, event: &UserRegistered) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .users
            .entry(event.user_id.clone())
            .or_insert_with(|| UserReplica {
                user_id: event.user_id.clone(),
                email: String::new(),
                phone_no: String::new(),
                profile_updated_at: None,
            });
        if row.email.is_empty() {
            row.email = event.email.clone();
        }
        if row.phone_no.is_empty() {
            row.phone_no = event.phone_no.clone();
        }
        Ok(())
    }

    fn apply_profile_update(&self, event: &UserProfileUpdated) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .users
            .entry(event.user_id.clone())
            .or_insert_with(|| UserReplica {
                user_id: event.user_id.clone(),
                email: String::new(),
                phone_no: String::new(),
                profile_updated_at: None,
            });

        if row.profile_updated_at.is_some_and(|seen| seen > event.updated_at) {
            return Ok(());
        }
        if let Some(email) = &event.email {
            row.email = email.clone();
        }
        if let Some(phone_no) = &event.phone_no {
            row.phone_no = phone_no.clone();
        }
        row.profile_updated_at = Some(event.updated_at);
        Ok(())
    }

    fn user_replica(&self, user_id: &UserId) -> Result<Option<UserReplica>, StoreError> {
        Ok(self.read()?.users.get(user_id).cloned())
    }
}

impl ProductReplicaStore for InMemoryOrderDb {
    fn upsert_listing(&self, event: &ProductCreated) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let now = Utc::now();
        let details = ProductDetails {
            name: event.name.clone(),
            price: event.price,
        };
        tables
            .products
            .entry(event.product_id.clone())
            .and_modify(|row| {
                row.details = Some(details.clone());
                row.updated_at = now;
            })
            .or_insert_with(|| ProductReplica {
                product_id: event.product_id.clone(),
                details: Some(details.clone()),
                inventory_count: event.inventory_count,
                updated_at: now,
            });
        Ok(())
    }

    fn upsert_inventory(&self, event: &ProductInventoryUpdated) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let now = Utc::now();
        tables
            .products
            .entry(event.product_id.clone())
            .and_modify(|row| {
                row.inventory_count = event.inventory_count;
                row.updated_at = now;
            })
            .or_insert_with(|| ProductReplica {
                product_id: event.product_id.clone(),
                details: None,
                inventory_count: event.inventory_count,
                updated_at: now,
            });
        Ok(())
    }

    fn product_replica(&self, product_id: &ProductId) -> Result<Option<ProductReplica>, StoreError> {
        Ok(self.read()?.products.get(product_id).cloned())
    }
}

impl OrderStore for InMemoryOrderDb {
    fn insert_order(&self, order: &Order, outbox: &[OutboxRecord]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.orders.contains_key(order.order_id()) {
            return Err(StoreError::Duplicate(format!("order {}", order.order_id())));
        }
        tables.orders.insert(order.order_id().clone(), order.clone());
        tables.outbox.extend_from_slice(outbox);
        Ok(())
    }

    fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(order_id).cloned())
    }

    fn list_orders(&self) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self.read()?.orders.values().cloned().collect();
        orders.sort_by(|a, b| {
            b.placed_at()
                .cmp(&a.placed_at())
                .then_with(|| b.order_id().cmp(a.order_id()))
        });
        Ok(orders)
    }
}

impl OutboxStore for InMemoryOrderDb {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        Ok(unsent(&self.read()?.outbox, limit))
    }

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        find_outbox(&mut tables.outbox, id)?.sent_at = Some(at);
        Ok(())
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = find_outbox(&mut tables.outbox, id)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProductTables {
    products: HashMap<ProductId, Product>,
    ledger: HashMap<OrderId, DeductionReport>,
    shortfalls: Vec<ConcurrencyError>,
    outbox: Vec<OutboxRecord>,
}

/// Product service database.
#[derive(Debug, Default)]
pub struct InMemoryProductDb {
    tables: RwLock<ProductTables>,
    availability: Availability,
}

impl InMemoryProductDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.availability.0.store(available, Ordering::SeqCst);
    }

    pub fn outbox(&self) -> Vec<OutboxRecord> {
        self.tables.read().map(|t| t.outbox.clone()).unwrap_or_default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ProductTables>, StoreError> {
        self.availability.check()?;
        self.tables.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ProductTables>, StoreError> {
        self.availability.check()?;
        self.tables.write().map_err(|_| poisoned())
    }
}

impl InventoryStore for InMemoryProductDb {
    fn create_product(&self, product: &Product, outbox: &OutboxRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.products.contains_key(&product.product_id) {
            return Err(StoreError::Duplicate(format!("product {}", product.product_id)));
        }
        tables.products.insert(product.product_id.clone(), product.clone());
        tables.outbox.push(outbox.clone());
        Ok(())
    }

    fn set_inventory(&self, product_id: &ProductId, count: u32) -> Result<Product, StoreError> {
        let mut tables = self.write()?;
        let mut updated = tables
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| StoreError::MissingReference(format!("product {product_id}")))?;
        updated.set_inventory(count, Utc::now());
        let row = OutboxRecord::for_event(&updated.inventory_event())?;

        tables.products.insert(product_id.clone(), updated.clone());
        tables.outbox.push(row);
        Ok(updated)
    }

    fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError> {
        Ok(self.read()?.products.get(product_id).cloned())
    }

    fn apply_order(&self, order: &OrderPlaced) -> Result<DeductionApplied, StoreError> {
        let mut tables = self.write()?;
        if let Some(report) = tables.ledger.get(&order.order_id) {
            return Ok(DeductionApplied::AlreadyProcessed(report.clone()));
        }

        // Stage on copies; nothing is visible until every step succeeded.
        let now = Utc::now();
        let mut staged: HashMap<ProductId, Product> = HashMap::new();
        let mut outcomes = Vec::with_capacity(order.items.len());
        for line in &order.items {
            let product = match staged.entry(line.product_id.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let current = tables.products.get(&line.product_id).cloned().ok_or_else(|| {
                        StoreError::MissingReference(format!("product {}", line.product_id))
                    })?;
                    e.insert(current)
                }
            };
            outcomes.push(product.try_deduct(line.quantity, now));
        }

        let mut rows = Vec::new();
        for outcome in &outcomes {
            if let LineOutcome::Deducted {
                product_id,
                remaining,
                ..
            } = outcome
            {
                rows.push(OutboxRecord::for_event(&ProductInventoryUpdated {
                    product_id: product_id.clone(),
                    inventory_count: *remaining,
                })?);
            }
        }

        let report = DeductionReport {
            order_id: order.order_id.clone(),
            outcomes,
        };
        tables.products.extend(staged);
        tables.outbox.extend(rows);
        tables.shortfalls.extend(report.shortfalls());
        tables.ledger.insert(order.order_id.clone(), report.clone());
        Ok(DeductionApplied::Applied(report))
    }

    fn processed_order(&self, order_id: &OrderId) -> Result<Option<DeductionReport>, StoreError> {
        Ok(self.read()?.ledger.get(order_id).cloned())
    }

    fn shortfalls(&self) -> Result<Vec<ConcurrencyError>, StoreError> {
        Ok(self.read()?.shortfalls.clone())
    }
}

impl OutboxStore for InMemoryProductDb {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        Ok(unsent(&self.read()?.outbox, limit))
    }

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        find_outbox(&mut tables.outbox, id)?.sent_at = Some(at);
        Ok(())
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let row = find_outbox(&mut tables.outbox, id)?;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }
}
