use anyhow::Context;

use storefront_infra::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    storefront_observability::init();

    let config = NodeConfig::from_env().context("invalid node configuration")?;
    let node = storefront_node::start(&config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    // Workers drive Postgres through the runtime handle, so join them off the async threads.
    tokio::task::spawn_blocking(move || node.shutdown()).await?;
    Ok(())
}
