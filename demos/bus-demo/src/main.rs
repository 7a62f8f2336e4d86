//! Holder and client macros sharing one in-process bus.
//!
//! Run with: cargo run -p bus-demo [-- path/to/config.json]
//!
//! Set `RUST_LOG=debug` to watch the protocol traffic.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use macro_env_client::{ClientEngine, ClientError};
use macro_env_core::{EnvConfig, EnvStorage, LocalBus, Transport};
use macro_env_holder::{Holder, storage::MacroFileStorage};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EnvConfig::from_file(&path).with_context(|| format!("loading {path}"))?,
        None => EnvConfig::default(),
    };

    let bus = LocalBus::new();

    let db_path = std::env::var_os("MACRO_ENV_DB")
        .map_or_else(|| std::env::temp_dir().join("ENV.js"), PathBuf::from);
    let storage: Arc<dyn EnvStorage> = Arc::new(MacroFileStorage::new(&db_path));
    if config.holder.durable {
        tracing::info!("environment file: {}", db_path.display());
    }

    let holder = Holder::start(&config.holder, Arc::new(bus.clone()), Some(storage)).await;

    // Unrelated chat traffic shares the bus.
    bus.broadcast("hello world".to_string()).await?;

    let client = Arc::new(ClientEngine::new(Arc::new(bus.clone()), config.client.clone()));
    let mut readiness = client.spawn_readiness_probe();
    readiness.changed().await?;
    if !readiness.borrow().is_ready() {
        tracing::warn!("environment holder is not responding, aborting");
        holder.shutdown().await?;
        return Ok(());
    }

    ping_macro(&client).await?;
    secret_macro(&client).await?;
    chatops_macro(&client).await;

    holder.shutdown().await?;
    Ok(())
}

async fn ping_macro(client: &ClientEngine) -> Result<(), ClientError> {
    let pong = client.get("PING").await?;
    tracing::info!("$PING = {}", pong.unwrap_or_default());
    Ok(())
}

async fn secret_macro(client: &ClientEngine) -> Result<(), ClientError> {
    let secret = client.get("DEVICE_SECRET").await?;
    tracing::info!("$DEVICE_SECRET = {}", secret.unwrap_or_default());

    client.set("DEVICE_SECRET", json!("rotated")).await?;
    let rotated = client.get("DEVICE_SECRET").await?;
    tracing::info!("$DEVICE_SECRET = {} after rotation", rotated.unwrap_or_default());
    Ok(())
}

async fn chatops_macro(client: &ClientEngine) {
    let (token, space) = tokio::join!(client.get("TEAMS_TOKEN"), client.get("TEAMS_SPACE"));
    match (token, space) {
        (Ok(Some(_)), Ok(Some(space))) => tracing::info!("chatops enabled for space {space}"),
        (Ok(_), Ok(_)) => tracing::info!("chatops disabled: TEAMS_TOKEN or TEAMS_SPACE not set"),
        (Err(e), _) | (_, Err(e)) => tracing::warn!("chatops disabled: {e}"),
    }
}
