use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use delivery_guard::{
    config::{LogFormat, LoggingSettings, Settings},
    metrics::Metrics,
    service::{router, AppState},
    store::{self, StoreClient},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = Settings::load(config_path.as_deref()).context("failed to load settings")?;

    init_tracing(&settings.logging);
    info!(
        config = config_path.as_deref().unwrap_or("<environment>"),
        "Starting delivery guard"
    );

    let metrics = Arc::new(Metrics::new()?);
    let backend = store::connect(&settings.store)
        .await
        .context("failed to connect to the shared store")?;
    let client = StoreClient::new(backend, settings.store.command_timeout(), metrics.clone());
    let state = AppState::new(client, &settings, metrics);

    if !state.admission.settings().enabled {
        warn!("rate limiting is disabled; every request will be admitted");
    }
    if !state.cache.is_enabled() {
        warn!("caching is disabled");
    }

    let addr = settings.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

/// `RUST_LOG` takes precedence over the configured level
fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("delivery_guard={}", logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}
