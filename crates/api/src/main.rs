use std::sync::Arc;

use anyhow::Context;

use shardmap_api::app::{self, services};
use shardmap_infra::MapperConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MapperConfig::from_env().context("invalid configuration")?;
    shardmap_observability::init(config.log_verbose);

    let services = Arc::new(services::build_services(config).await?);
    let runner = services
        .spawn_runner(tokio::runtime::Handle::current())
        .context("failed to start task runner")?;

    let app = app::build_app(services);

    let addr = std::env::var("SHARDMAP_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!(stats = ?runner.stats(), "shutting down task runner");
    tokio::task::spawn_blocking(move || runner.shutdown()).await?;
    Ok(())
}
