use anyhow::Context;

use retrier_api::app::{build_app, services::AppRuntime};
use retrier_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    retrier_observability::tracing::init_with(&config.log_filter, config.log_format);

    let runtime = AppRuntime::start(&config).await?;
    let app = build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Joining the worker threads blocks.
    tokio::task::spawn_blocking(move || runtime.shutdown())
        .await
        .context("shutdown task panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutdown requested");
}
