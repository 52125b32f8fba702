//! Postgres-backed stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check violation) | `23514` | `Corrupt` |
//! | Database (other) | any other | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | RowNotFound / decode errors | N/A | `Corrupt` |
//!
//! ## Sync bridge
//!
//! The store traits are synchronous because subscription workers and the relay
//! run on plain threads. Each store keeps the `tokio` runtime handle it was
//! created on and drives its async queries with `Handle::block_on`; trait
//! methods must therefore not be called from inside an async task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{instrument, warn};
use uuid::Uuid;

use storefront_core::{OrderId, ProductId, UserId};
use storefront_events::{
    OrderPlaced, ProductCreated, ProductInventoryUpdated, Topic, UserProfileUpdated, UserRegistered,
};
use storefront_orders::{Order, OrderItem, OrderStatus};
use storefront_products::{ConcurrencyError, DeductionReport, LineOutcome, Product};

use super::{
    DeductionApplied, InventoryStore, OrderStore, OutboxStore, ProductDetails, ProductReplica,
    ProductReplicaStore, StoreError, UserReplica, UserReplicaStore,
};
use crate::outbox::OutboxRecord;

const OUTBOX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    seq         BIGSERIAL,
    id          UUID PRIMARY KEY,
    topic       TEXT NOT NULL,
    event_name  TEXT NOT NULL,
    payload     BYTEA NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    sent_at     TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS outbox_unsent_idx ON outbox (seq) WHERE sent_at IS NULL;
"#;

/// Order service tables.
pub const ORDER_SERVICE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id     TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    total_price  DOUBLE PRECISION NOT NULL,
    status       TEXT NOT NULL,
    placed_at    TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS order_items (
    order_id        TEXT NOT NULL REFERENCES orders (order_id),
    line_no         INTEGER NOT NULL,
    product_id      TEXT NOT NULL,
    quantity        BIGINT NOT NULL CHECK (quantity > 0),
    price_at_order  DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (order_id, line_no)
);
CREATE TABLE IF NOT EXISTS user_replicas (
    user_id             TEXT PRIMARY KEY,
    email               TEXT NOT NULL,
    phone_no            TEXT NOT NULL,
    profile_updated_at  TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS product_replicas (
    product_id       TEXT PRIMARY KEY,
    name             TEXT,
    price            DOUBLE PRECISION,
    inventory_count  BIGINT NOT NULL CHECK (inventory_count >= 0),
    updated_at       TIMESTAMPTZ NOT NULL
);
"#;

/// Product service tables.
pub const PRODUCT_SERVICE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    product_id       TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    price            DOUBLE PRECISION NOT NULL CHECK (price >= 0),
    inventory_count  BIGINT NOT NULL CHECK (inventory_count >= 0),
    updated_at       TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS processed_orders (
    order_id      TEXT PRIMARY KEY,
    outcomes      JSONB NOT NULL,
    processed_at  TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS inventory_shortfalls (
    id           BIGSERIAL PRIMARY KEY,
    order_id     TEXT NOT NULL,
    product_id   TEXT NOT NULL,
    requested    BIGINT NOT NULL,
    available    BIGINT NOT NULL,
    recorded_at  TIMESTAMPTZ NOT NULL
);
"#;

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Duplicate(msg),
                Some("23514") => StoreError::Corrupt(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::Corrupt(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn to_count(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn parse_id<T>(raw: String, column: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr<Err = storefront_core::DomainError>,
{
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    row: &OutboxRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, topic, event_name, payload, created_at, attempts, last_error, sent_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.id)
    .bind(row.topic.as_str())
    .bind(&row.event_name)
    .bind(&row.payload)
    .bind(row.created_at)
    .bind(row.attempts as i32)
    .bind(&row.last_error)
    .bind(row.sent_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox", e))?;
    Ok(())
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    let topic: String = row.try_get("topic").map_err(|e| map_sqlx_error("outbox_row", e))?;
    let attempts: i32 = row.try_get("attempts").map_err(|e| map_sqlx_error("outbox_row", e))?;
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(|e| map_sqlx_error("outbox_row", e))?,
        topic: topic
            .parse::<Topic>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        event_name: row.try_get("event_name").map_err(|e| map_sqlx_error("outbox_row", e))?,
        payload: row.try_get("payload").map_err(|e| map_sqlx_error("outbox_row", e))?,
        created_at: row.try_get("created_at").map_err(|e| map_sqlx_error("outbox_row", e))?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(|e| map_sqlx_error("outbox_row", e))?,
        sent_at: row.try_get("sent_at").map_err(|e| map_sqlx_error("outbox_row", e))?,
    })
}

/// Outbox queries shared by both service databases.
#[derive(Debug, Clone)]
struct PgOutbox {
    pool: Arc<PgPool>,
}

impl PgOutbox {
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, event_name, payload, created_at, attempts, last_error, sent_at
            FROM outbox
            WHERE sent_at IS NULL
            ORDER BY seq ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unsent", e))?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE outbox SET sent_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_sent", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingReference(format!("outbox row {id}")));
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_failure", e))?;
        Ok(())
    }
}

/// Order service database on Postgres.
#[derive(Debug, Clone)]
pub struct PostgresOrderDb {
    pool: Arc<PgPool>,
    outbox: PgOutbox,
    runtime: Handle,
}

impl PostgresOrderDb {
    /// `runtime` drives queries issued through the synchronous store traits.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        let pool = Arc::new(pool);
        Self {
            outbox: PgOutbox { pool: pool.clone() },
            pool,
            runtime,
        }
    }

    /// Create tables if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(OUTBOX_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        sqlx::raw_sql(ORDER_SERVICE_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(
        skip(self, order, outbox),
        fields(order_id = %order.order_id(), outbox_rows = outbox.len()),
        err
    )]
    pub async fn insert_order_tx(&self, order: &Order, outbox: &[OutboxRecord]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, user_id, total_price, status, placed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(order.order_id().as_str())
        .bind(order.user_id().as_str())
        .bind(order.total_price())
        .bind(order.status().as_str())
        .bind(order.placed_at())
        .bind(order.updated_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for (line_no, item) in order.items().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, line_no, product_id, quantity, price_at_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order.order_id().as_str())
            .bind(line_no as i32)
            .bind(item.product_id.as_str())
            .bind(i64::from(item.quantity))
            .bind(item.price_at_order)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }

        for row in outbox {
            insert_outbox(&mut tx, row).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn load_items(&self, order_ids: &[String]) -> Result<HashMap<String, Vec<OrderItem>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, quantity, price_at_order
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id ASC, line_no ASC
            "#,
        )
        .bind(order_ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_items", e))?;

        let mut items: HashMap<String, Vec<OrderItem>> = HashMap::new();
        for row in rows {
            let order_id: String = row.try_get("order_id").map_err(|e| map_sqlx_error("load_items", e))?;
            let product_id: String = row.try_get("product_id").map_err(|e| map_sqlx_error("load_items", e))?;
            let quantity: i64 = row.try_get("quantity").map_err(|e| map_sqlx_error("load_items", e))?;
            items.entry(order_id).or_default().push(OrderItem {
                product_id: parse_id(product_id, "order_items.product_id")?,
                quantity: to_count(quantity, "order_items.quantity")?,
                price_at_order: row
                    .try_get("price_at_order")
                    .map_err(|e| map_sqlx_error("load_items", e))?,
            });
        }
        Ok(items)
    }

    async fn load_orders(&self, only: Option<&OrderId>) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, user_id, status, placed_at, updated_at
            FROM orders
            WHERE ($1::text IS NULL OR order_id = $1)
            ORDER BY placed_at DESC, order_id DESC
            "#,
        )
        .bind(only.map(OrderId::as_str))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_orders", e))?;

        let ids: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("order_id"))
            .collect::<Result<_, _>>()
            .map_err(|e| map_sqlx_error("load_orders", e))?;
        let mut items = self.load_items(&ids).await?;

        let mut orders = Vec::with_capacity(rows.len());
        for (row, id) in rows.iter().zip(ids) {
            let user_id: String = row.try_get("user_id").map_err(|e| map_sqlx_error("load_orders", e))?;
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("load_orders", e))?;
            orders.push(Order::restore(
                parse_id(id.clone(), "orders.order_id")?,
                parse_id(user_id, "orders.user_id")?,
                items.remove(&id).unwrap_or_default(),
                status
                    .parse::<OrderStatus>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                row.try_get("placed_at").map_err(|e| map_sqlx_error("load_orders", e))?,
                row.try_get("updated_at").map_err(|e| map_sqlx_error("load_orders", e))?,
            ));
        }
        Ok(orders)
    }

    async fn upsert_user_async(&self, event: &UserRegistered) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_replicas (user_id, email, phone_no, profile_updated_at)
            VALUES ($1, $2, $3, NULL)
            ON CONFLICT (user_id) DO UPDATE SET
                email = CASE WHEN user_replicas.email = '' THEN EXCLUDED.email ELSE user_replicas.email END,
                phone_no = CASE WHEN user_replicas.phone_no = '' THEN EXCLUDED.phone_no ELSE user_replicas.phone_no END
            "#,
        )
        .bind(event.user_id.as_str())
        .bind(&event.email)
        .bind(&event.phone_no)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_user", e))?;
        Ok(())
    }

    async fn apply_profile_update_async(&self, event: &UserProfileUpdated) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_replicas (user_id, email, phone_no, profile_updated_at)
            VALUES ($1, COALESCE($2, ''), COALESCE($3, ''), $4)
            ON CONFLICT (user_id) DO UPDATE SET
                email = COALESCE($2, user_replicas.email),
                phone_no = COALESCE($3, user_replicas.phone_no),
                profile_updated_at = $4
            WHERE user_replicas.profile_updated_at IS NULL
               OR user_replicas.profile_updated_at <= $4
            "#,
        )
        .bind(event.user_id.as_str())
        .bind(&event.email)
        .bind(&event.phone_no)
        .bind(event.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply_profile_update", e))?;
        Ok(())
    }

    async fn user_replica_async(&self, user_id: &UserId) -> Result<Option<UserReplica>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, email, phone_no, profile_updated_at FROM user_replicas WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("user_replica", e))?;

        row.map(|r| {
            Ok(UserReplica {
                user_id: user_id.clone(),
                email: r.try_get("email").map_err(|e| map_sqlx_error("user_replica", e))?,
                phone_no: r.try_get("phone_no").map_err(|e| map_sqlx_error("user_replica", e))?,
                profile_updated_at: r
                    .try_get("profile_updated_at")
                    .map_err(|e| map_sqlx_error("user_replica", e))?,
            })
        })
        .transpose()
    }

    async fn upsert_listing_async(&self, event: &ProductCreated) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO product_replicas (product_id, name, price, inventory_count, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (product_id) DO UPDATE SET
                name = EXCLUDED.name,
                price = EXCLUDED.price,
                updated_at = NOW()
            "#,
        )
        .bind(event.product_id.as_str())
        .bind(&event.name)
        .bind(event.price)
        .bind(i64::from(event.inventory_count))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_listing", e))?;
        Ok(())
    }

    async fn upsert_inventory_async(&self, event: &ProductInventoryUpdated) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO product_replicas (product_id, name, price, inventory_count, updated_at)
            VALUES ($1, NULL, NULL, $2, NOW())
            ON CONFLICT (product_id) DO UPDATE SET
                inventory_count = EXCLUDED.inventory_count,
                updated_at = NOW()
            "#,
        )
        .bind(event.product_id.as_str())
        .bind(i64::from(event.inventory_count))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_inventory", e))?;
        Ok(())
    }

    async fn product_replica_async(&self, product_id: &ProductId) -> Result<Option<ProductReplica>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT name, price, inventory_count, updated_at
            FROM product_replicas
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("product_replica", e))?;

        let Some(r) = row else {
            return Ok(None);
        };
        let name: Option<String> = r.try_get("name").map_err(|e| map_sqlx_error("product_replica", e))?;
        let price: Option<f64> = r.try_get("price").map_err(|e| map_sqlx_error("product_replica", e))?;
        let count: i64 = r
            .try_get("inventory_count")
            .map_err(|e| map_sqlx_error("product_replica", e))?;

        Ok(Some(ProductReplica {
            product_id: product_id.clone(),
            details: name.zip(price).map(|(name, price)| ProductDetails { name, price }),
            inventory_count: to_count(count, "product_replicas.inventory_count")?,
            updated_at: r.try_get("updated_at").map_err(|e| map_sqlx_error("product_replica", e))?,
        }))
    }
}

impl UserReplicaStore for PostgresOrderDb {
    fn upsert_user(&self, event: &UserRegistered) -> Result<(), StoreError> {
        self.block_on(self.upsert_user_async(event))
    }

    fn apply_profile_update(&self, event: &UserProfileUpdated) -> Result<(), StoreError> {
        self.block_on(self.apply_profile_update_async(event))
    }

    fn user_replica(&self, user_id: &UserId) -> Result<Option<UserReplica>, StoreError> {
        self.block_on(self.user_replica_async(user_id))
    }
}

impl ProductReplicaStore for PostgresOrderDb {
    fn upsert_listing(&self, event: &ProductCreated) -> Result<(), StoreError> {
        self.block_on(self.upsert_listing_async(event))
    }

    fn upsert_inventory(&self, event: &ProductInventoryUpdated) -> Result<(), StoreError> {
        self.block_on(self.upsert_inventory_async(event))
    }

    fn product_replica(&self, product_id: &ProductId) -> Result<Option<ProductReplica>, StoreError> {
        self.block_on(self.product_replica_async(product_id))
    }
}

impl OrderStore for PostgresOrderDb {
    fn insert_order(&self, order: &Order, outbox: &[OutboxRecord]) -> Result<(), StoreError> {
        self.block_on(self.insert_order_tx(order, outbox))
    }

    fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>, StoreError> {
        let mut orders = self.block_on(self.load_orders(Some(order_id)))?;
        Ok(orders.pop())
    }

    fn list_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.block_on(self.load_orders(None))
    }
}

impl OutboxStore for PostgresOrderDb {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.block_on(self.outbox.fetch_unsent(limit))
    }

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.block_on(self.outbox.mark_sent(id, at))
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.block_on(self.outbox.record_failure(id, error))
    }
}

/// Product service database on Postgres.
#[derive(Debug, Clone)]
pub struct PostgresProductDb {
    pool: Arc<PgPool>,
    outbox: PgOutbox,
    runtime: Handle,
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let product_id: String = row.try_get("product_id").map_err(|e| map_sqlx_error("product_row", e))?;
    let count: i64 = row
        .try_get("inventory_count")
        .map_err(|e| map_sqlx_error("product_row", e))?;
    Ok(Product {
        product_id: parse_id(product_id, "products.product_id")?,
        name: row.try_get("name").map_err(|e| map_sqlx_error("product_row", e))?,
        price: row.try_get("price").map_err(|e| map_sqlx_error("product_row", e))?,
        inventory_count: to_count(count, "products.inventory_count")?,
        updated_at: row.try_get("updated_at").map_err(|e| map_sqlx_error("product_row", e))?,
    })
}

impl PostgresProductDb {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        let pool = Arc::new(pool);
        Self {
            outbox: PgOutbox { pool: pool.clone() },
            pool,
            runtime,
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(OUTBOX_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        sqlx::raw_sql(PRODUCT_SERVICE_SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, product, outbox), fields(product_id = %product.product_id), err)]
    pub async fn create_product_tx(&self, product: &Product, outbox: &OutboxRecord) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO products (product_id, name, price, inventory_count, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(product.product_id.as_str())
        .bind(&product.name)
        .bind(product.price)
        .bind(i64::from(product.inventory_count))
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;

        insert_outbox(&mut tx, outbox).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn set_inventory_tx(
        &self,
        product_id: &ProductId,
        count: u32,
    ) -> Result<Product, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            UPDATE products SET inventory_count = $2, updated_at = $3
            WHERE product_id = $1
            RETURNING product_id, name, price, inventory_count, updated_at
            "#,
        )
        .bind(product_id.as_str())
        .bind(i64::from(count))
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_inventory", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::MissingReference(format!("product {product_id}")));
        };
        let product = product_from_row(&row)?;

        // Built under the row lock taken by the UPDATE.
        let outbox = OutboxRecord::for_event(&product.inventory_event())?;
        insert_outbox(&mut tx, &outbox).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(product)
    }

    async fn get_product_async(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT product_id, name, price, inventory_count, updated_at
            FROM products
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn load_report(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &OrderId,
    ) -> Result<Option<DeductionReport>, StoreError> {
        let row = sqlx::query("SELECT outcomes FROM processed_orders WHERE order_id = $1")
            .bind(order_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_report", e))?;

        row.map(|r| {
            let Json(outcomes): Json<Vec<LineOutcome>> =
                r.try_get("outcomes").map_err(|e| map_sqlx_error("load_report", e))?;
            Ok(DeductionReport {
                order_id: order_id.clone(),
                outcomes,
            })
        })
        .transpose()
    }

    /// Ledger claim, guarded decrements, shortfalls and outbox rows in one transaction.
    #[instrument(
        skip(self, order),
        fields(order_id = %order.order_id, lines = order.items.len()),
        err
    )]
    pub async fn apply_order_tx(&self, order: &OrderPlaced) -> Result<DeductionApplied, StoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Concurrent duplicates block on the primary key until the first commits.
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_orders (order_id, outcomes, processed_at)
            VALUES ($1, '[]'::jsonb, $2)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order.order_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_order", e))?
        .rows_affected();

        if claimed == 0 {
            let report = Self::load_report(&mut tx, &order.order_id)
                .await?
                .ok_or_else(|| StoreError::Corrupt(format!("ledger row for {} vanished", order.order_id)))?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(DeductionApplied::AlreadyProcessed(report));
        }

        let mut outcomes = Vec::with_capacity(order.items.len());
        for line in &order.items {
            let deducted = sqlx::query(
                r#"
                UPDATE products
                SET inventory_count = inventory_count - $2, updated_at = $3
                WHERE product_id = $1 AND inventory_count >= $2
                RETURNING inventory_count
                "#,
            )
            .bind(line.product_id.as_str())
            .bind(i64::from(line.quantity))
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("deduct_line", e))?;

            if let Some(row) = deducted {
                let remaining: i64 = row
                    .try_get("inventory_count")
                    .map_err(|e| map_sqlx_error("deduct_line", e))?;
                outcomes.push(LineOutcome::Deducted {
                    product_id: line.product_id.clone(),
                    quantity: line.quantity,
                    remaining: to_count(remaining, "products.inventory_count")?,
                });
                continue;
            }

            let available: Option<i64> =
                sqlx::query_scalar("SELECT inventory_count FROM products WHERE product_id = $1")
                    .bind(line.product_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("read_stock", e))?;

            match available {
                Some(available) => outcomes.push(LineOutcome::Shortfall {
                    product_id: line.product_id.clone(),
                    requested: line.quantity,
                    available: to_count(available, "products.inventory_count")?,
                }),
                None => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(StoreError::MissingReference(format!("product {}", line.product_id)));
                }
            }
        }

        let report = DeductionReport {
            order_id: order.order_id.clone(),
            outcomes,
        };

        for outcome in &report.outcomes {
            if let LineOutcome::Deducted {
                product_id,
                remaining,
                ..
            } = outcome
            {
                let row = OutboxRecord::for_event(&ProductInventoryUpdated {
                    product_id: product_id.clone(),
                    inventory_count: *remaining,
                })?;
                insert_outbox(&mut tx, &row).await?;
            }
        }

        for shortfall in report.shortfalls() {
            warn!(
                order_id = %shortfall.order_id,
                product_id = %shortfall.product_id,
                requested = shortfall.requested,
                available = shortfall.available,
                "recording inventory shortfall"
            );
            sqlx::query(
                r#"
                INSERT INTO inventory_shortfalls (order_id, product_id, requested, available, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(shortfall.order_id.as_str())
            .bind(shortfall.product_id.as_str())
            .bind(i64::from(shortfall.requested))
            .bind(i64::from(shortfall.available))
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_shortfall", e))?;
        }

        sqlx::query("UPDATE processed_orders SET outcomes = $2 WHERE order_id = $1")
            .bind(order.order_id.as_str())
            .bind(Json(&report.outcomes))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("store_outcomes", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(DeductionApplied::Applied(report))
    }

    async fn processed_order_async(&self, order_id: &OrderId) -> Result<Option<DeductionReport>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let report = Self::load_report(&mut tx, order_id).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(report)
    }

    async fn shortfalls_async(&self) -> Result<Vec<ConcurrencyError>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, requested, available
            FROM inventory_shortfalls
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("shortfalls", e))?;

        rows.iter()
            .map(|r| {
                let order_id: String = r.try_get("order_id").map_err(|e| map_sqlx_error("shortfalls", e))?;
                let product_id: String = r.try_get("product_id").map_err(|e| map_sqlx_error("shortfalls", e))?;
                let requested: i64 = r.try_get("requested").map_err(|e| map_sqlx_error("shortfalls", e))?;
                let available: i64 = r.try_get("available").map_err(|e| map_sqlx_error("shortfalls", e))?;
                Ok(ConcurrencyError {
                    order_id: parse_id(order_id, "inventory_shortfalls.order_id")?,
                    product_id: parse_id(product_id, "inventory_shortfalls.product_id")?,
                    requested: to_count(requested, "inventory_shortfalls.requested")?,
                    available: to_count(available, "inventory_shortfalls.available")?,
                })
            })
            .collect()
    }
}

impl InventoryStore for PostgresProductDb {
    fn create_product(&self, product: &Product, outbox: &OutboxRecord) -> Result<(), StoreError> {
        self.block_on(self.create_product_tx(product, outbox))
    }

    fn set_inventory(&self, product_id: &ProductId, count: u32) -> Result<Product, StoreError> {
        self.block_on(self.set_inventory_tx(product_id, count))
    }

    fn get_product(&self, product_id: &ProductId) -> Result<Option<Product>, StoreError> {
        self.block_on(self.get_product_async(product_id))
    }

    fn apply_order(&self, order: &OrderPlaced) -> Result<DeductionApplied, StoreError> {
        self.block_on(self.apply_order_tx(order))
    }

    fn processed_order(&self, order_id: &OrderId) -> Result<Option<DeductionReport>, StoreError> {
        self.block_on(self.processed_order_async(order_id))
    }

    fn shortfalls(&self) -> Result<Vec<ConcurrencyError>, StoreError> {
        self.block_on(self.shortfalls_async())
    }
}

impl OutboxStore for PostgresProductDb {
    fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        self.block_on(self.outbox.fetch_unsent(limit))
    }

    fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.block_on(self.outbox.mark_sent(id, at))
    }

    fn record_failure(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.block_on(self.outbox.record_failure(id, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counts_are_corrupt() {
        assert!(matches!(to_count(-1, "x"), Err(StoreError::Corrupt(_))));
        assert_eq!(to_count(7, "x").unwrap(), 7);
    }

    #[test]
    fn pool_failures_are_transient() {
        let err = map_sqlx_error("op", sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());

        let err = map_sqlx_error("op", sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn schemas_declare_non_negative_stock() {
        assert!(PRODUCT_SERVICE_SCHEMA.contains("inventory_count >= 0"));
        assert!(ORDER_SERVICE_SCHEMA.contains("product_replicas"));
    }
}
