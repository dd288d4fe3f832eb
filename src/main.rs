// =============================================================================
// Confluence Sentinel — Main Entry Point
// =============================================================================
//
// Resolves configuration from the environment, builds the Core, starts the
// persistent store connection (non-blocking on failure), spawns the
// detection/retention timers and the HTTP query surface, then waits for a
// termination signal to drive graceful shutdown.
// =============================================================================

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use confluence_sentinel::api;
use confluence_sentinel::config::Config;
use confluence_sentinel::core::Core;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(port = config.port, top_n = config.top_n_symbols, "starting confluence sentinel");
    if let Some(frontend_url) = &config.frontend_url {
        tracing::info!(frontend_url, "configured frontend origin (informational; CORS mirrors the request origin with credentials allowed)");
    }

    let core = Arc::new(Core::new(config));

    core.connect_store().await;
    {
        let core = core.clone();
        tokio::spawn(async move {
            core.reconnect_loop().await;
        });
    }

    let timer_handles = core.spawn_timers();

    let app = api::rest::router(core.clone());
    let port = core.config().port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "query surface listening");

    core.mark_running();

    let server_core = core.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server exited with error");
        }
        let _ = server_core;
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    core.shutdown().await;
    server.abort();
    for handle in timer_handles {
        handle.abort();
    }

    Ok(())
}
