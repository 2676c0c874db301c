// Worker entry point: scheduler + workers, no HTTP gateway.
//
// Deployments that split the API from job execution run this next to the
// `server` binary pointed at the same database file.

use anyhow::{Context, Result};
use server_core::server::build_runtime;
use server_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AlephAuto worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    let runtime = build_runtime(&config)
        .await
        .context("Failed to initialize runtime")?;
    runtime
        .scheduler
        .start(config.run_on_startup)
        .await
        .context("Failed to start scheduler")?;
    runtime.state.events.system_status("started").await;

    tracing::info!("Worker running; press Ctrl+C to stop");
    let _ = tokio::signal::ctrl_c().await;

    tracing::info!("Shutdown signal received, quiescing");
    runtime.shutdown().await;

    Ok(())
}
