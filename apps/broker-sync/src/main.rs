//! Broker Sync Binary
//!
//! Starts the account synchronization service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `BROKER_SYNC_TOKEN`: Bearer token for the gateway handshake
//!
//! ## Optional
//! - `BROKER_SYNC_GATEWAY_URL`: Gateway base URL (default: ws://localhost:8001)
//! - `BROKER_SYNC_ENV`: DEMO | LIVE (default: DEMO)
//! - `BROKER_SYNC_ACCOUNTS`: Comma-separated `broker:account` pairs to
//!   connect at startup (e.g. `tradovate:123,tradovate:456`)
//! - `BROKER_SYNC_STORAGE_PATH`: Key-value store file (default: broker-sync-state.json)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::Result;
use broker_sync::infrastructure::telemetry;
use broker_sync::{
    ConnectionManager, EnvTokenProvider, FileStore, ManagerConnectExt, SyncConfig, init_metrics,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting broker sync service");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = SyncConfig::from_env()?;
    log_config(&config);

    let store = Arc::new(FileStore::new(config.storage_path.clone()));
    let token_provider = Arc::new(EnvTokenProvider::default());

    let manager = ConnectionManager::new(config, token_provider, store);
    manager.start().await;

    // Connect the accounts named at startup; later connects arrive via
    // whatever embeds this service.
    for (broker_id, account_id) in startup_accounts() {
        match manager.connect(&broker_id, &account_id).await {
            Ok(()) => {
                tracing::info!(broker = %broker_id, account = %account_id, "account connected");
            }
            Err(e) => {
                tracing::error!(
                    broker = %broker_id,
                    account = %account_id,
                    error = %e,
                    "account connect failed"
                );
            }
        }
    }

    tracing::info!("Broker sync ready");

    await_shutdown().await;

    manager.shutdown().await;
    tracing::info!("Broker sync stopped");
    Ok(())
}

/// Parse `BROKER_SYNC_ACCOUNTS` into (broker, account) pairs.
fn startup_accounts() -> Vec<(String, String)> {
    std::env::var("BROKER_SYNC_ACCOUNTS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (broker, account) = pair.trim().split_once(':')?;
            if broker.is_empty() || account.is_empty() {
                None
            } else {
                Some((broker.to_string(), account.to_string()))
            }
        })
        .collect()
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        gateway_url = %config.base_url,
        storage_path = %config.storage_path,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
