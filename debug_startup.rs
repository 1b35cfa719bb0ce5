// Step-by-step startup probe for diagnosing store connectivity
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use delivery_guard::{
    config::Settings,
    limiter::AdmissionService,
    metrics::Metrics,
    store::{RedisStore, RedisStoreConfig, StoreClient},
};

const PROBE_IDENTITY: &str = "debug-startup-probe";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting debug startup probe...");
    let start_time = Instant::now();

    let settings = Settings::load(std::env::var("CONFIG_PATH").ok().as_deref())?;
    let client = probe_store(&settings).await?;
    probe_admission_status(client, &settings).await?;

    info!("All probes completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

async fn probe_store(settings: &Settings) -> Result<StoreClient> {
    let config = RedisStoreConfig::from(&settings.store);
    info!("Using store URL: {}", config.url);

    let connection_start = Instant::now();
    info!("Connecting with 10 second timeout...");
    let result = tokio::time::timeout(Duration::from_secs(10), RedisStore::connect(&config)).await;

    let store = match result {
        Ok(Ok(store)) => {
            info!("Store connected in {:?}", connection_start.elapsed());
            store
        }
        Ok(Err(e)) => {
            error!("Store connection failed: {}", e);
            return Err(e.into());
        }
        Err(_) => {
            error!("Store connection timed out after 10 seconds");
            error!("This suggests a network connectivity issue or the server is not responding");
            return Err(anyhow::anyhow!("store connection timeout"));
        }
    };

    let client = StoreClient::new(
        Arc::new(store),
        settings.store.command_timeout(),
        Arc::new(Metrics::new()?),
    );

    info!("Command timeout: {:?}", client.command_timeout());
    let health_start = Instant::now();
    match client.health_check().await {
        Ok(()) => info!("Health check passed in {:?}", health_start.elapsed()),
        Err(e) => {
            error!("Health check failed: {}", e);
            return Err(e.into());
        }
    }

    match client.key_count().await {
        Ok(count) => info!("Store holds {} keys", count),
        Err(e) => error!("Key count failed: {}", e),
    }

    Ok(client)
}

async fn probe_admission_status(client: StoreClient, settings: &Settings) -> Result<()> {
    let admission = AdmissionService::new(
        client,
        settings.rate_limit.clone(),
        Arc::new(Metrics::new()?),
    );

    let status_start = Instant::now();
    let status = admission.get_status(PROBE_IDENTITY, false).await?;
    info!(
        limit = status.limit,
        remaining = status.remaining,
        banned = status.banned_until.is_some(),
        "Admission status read in {:?}",
        status_start.elapsed()
    );
    Ok(())
}
