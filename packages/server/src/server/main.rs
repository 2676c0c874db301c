// Main entry point for the API server (gateway + scheduler + workers)

use anyhow::{Context, Result};
use server_core::server::{build_app, build_runtime};
use server_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AlephAuto API server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Build the runtime (store, workers, scheduler) and start triggers
    let runtime = build_runtime(&config)
        .await
        .context("Failed to initialize runtime")?;
    runtime
        .scheduler
        .start(config.run_on_startup)
        .await
        .context("Failed to start scheduler")?;
    runtime.state.events.system_status("started").await;

    // Build application
    let app = build_app(runtime.state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);
    tracing::info!("Dashboard feed: ws://localhost:{}/ws", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutdown signal received, quiescing");
    runtime.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
