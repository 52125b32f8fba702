//! Service process wiring: one role (order or product service) per process.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

use storefront_events::{DeadLetterSink, EventBus, InMemoryBroker, InMemoryDeadLetterSink};
use storefront_infra::config::{BusBackend, NodeConfig, ServiceRole};
use storefront_infra::event_bus::RedisStreamsEventBus;
use storefront_infra::outbox::OutboxRelay;
use storefront_infra::services::{spawn_order_service_consumers, spawn_product_service_consumers};
use storefront_infra::store::{
    InMemoryOrderDb, InMemoryProductDb, InventoryStore, OutboxStore, PostgresOrderDb,
    PostgresProductDb, ProductReplicaStore, UserReplicaStore,
};
use storefront_infra::workers::{WorkerHandle, shutdown_all};

/// A running service: its subscription workers plus the outbox relay.
#[derive(Debug)]
pub struct Node {
    role: ServiceRole,
    workers: Vec<WorkerHandle>,
}

impl Node {
    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Stop every worker and wait for them. Blocks; call off the async runtime.
    pub fn shutdown(self) {
        info!(role = ?self.role, workers = self.workers.len(), "stopping node");
        shutdown_all(self.workers);
    }
}

/// Build stores and bus from `config` and start the role's workers.
pub async fn start(config: &NodeConfig) -> anyhow::Result<Node> {
    match &config.bus {
        BusBackend::Memory => {
            let broker = InMemoryBroker::new();
            start_with_bus(config, broker, Arc::new(InMemoryDeadLetterSink::new())).await
        }
        BusBackend::Redis { url, stream_prefix } => {
            let bus = RedisStreamsEventBus::new(url, Some(stream_prefix.clone()))
                .context("failed to create Redis Streams event bus")?;
            start_with_bus(config, bus.clone(), bus).await
        }
    }
}

async fn start_with_bus<B, D>(config: &NodeConfig, bus: B, dead_letters: D) -> anyhow::Result<Node>
where
    B: EventBus + Clone + 'static,
    D: DeadLetterSink + Clone + 'static,
{
    let pool = match &config.database_url {
        Some(url) => Some(
            PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?,
        ),
        None => None,
    };

    let workers = match (config.role, pool) {
        (ServiceRole::Order, Some(pool)) => {
            let db = Arc::new(PostgresOrderDb::new(pool, Handle::current()));
            db.ensure_schema().await.context("order schema")?;
            order_service(config, bus, dead_letters, db)?
        }
        (ServiceRole::Order, None) => {
            order_service(config, bus, dead_letters, Arc::new(InMemoryOrderDb::new()))?
        }
        (ServiceRole::Product, Some(pool)) => {
            let db = Arc::new(PostgresProductDb::new(pool, Handle::current()));
            db.ensure_schema().await.context("product schema")?;
            product_service(config, bus, dead_letters, db)?
        }
        (ServiceRole::Product, None) => {
            product_service(config, bus, dead_letters, Arc::new(InMemoryProductDb::new()))?
        }
    };

    info!(
        role = ?config.role,
        group = %config.consumer_group,
        persistent = config.database_url.is_some(),
        workers = workers.len(),
        "node started"
    );
    Ok(Node {
        role: config.role,
        workers,
    })
}

fn order_service<B, D, S>(
    config: &NodeConfig,
    bus: B,
    dead_letters: D,
    store: S,
) -> anyhow::Result<Vec<WorkerHandle>>
where
    B: EventBus + Clone + 'static,
    D: DeadLetterSink + Clone + 'static,
    S: UserReplicaStore + ProductReplicaStore + OutboxStore + Clone + 'static,
{
    let mut workers = spawn_order_service_consumers(
        bus.clone(),
        &config.consumer_group,
        store.clone(),
        dead_letters,
        config.subscription.clone(),
    )?;
    match OutboxRelay::new(store, bus, config.relay.clone()).spawn() {
        Ok(relay) => workers.push(relay),
        Err(err) => {
            shutdown_all(workers);
            return Err(err).context("failed to start outbox relay");
        }
    }
    Ok(workers)
}

fn product_service<B, D, S>(
    config: &NodeConfig,
    bus: B,
    dead_letters: D,
    store: S,
) -> anyhow::Result<Vec<WorkerHandle>>
where
    B: EventBus + Clone + 'static,
    D: DeadLetterSink + Clone + 'static,
    S: InventoryStore + OutboxStore + Clone + 'static,
{
    let mut workers = spawn_product_service_consumers(
        bus.clone(),
        &config.consumer_group,
        store.clone(),
        dead_letters,
        config.subscription.clone(),
    )?;
    match OutboxRelay::new(store, bus, config.relay.clone()).spawn() {
        Ok(relay) => workers.push(relay),
        Err(err) => {
            shutdown_all(workers);
            return Err(err).context("failed to start outbox relay");
        }
    }
    Ok(workers)
}
