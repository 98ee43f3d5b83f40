use anyhow::{Context, Result};
use porthole_relay::{router, AppState, RelayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("porthole_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    let addr = config.bind;
    info!(
        "Porthole Relay on {} (request timeout {:?}, keepalive {:?})",
        addr, config.request_timeout, config.ping_interval
    );

    let app = router(AppState::new(config));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down relay");
        })
        .await?;
    Ok(())
}
