//! Monitor binary: keeps the provider alive and records contract events.
//! Distribution requests are only served by the API process.

use std::{io, sync::Arc};

use chainops_domain::{
    config::{ChainConfig, StorageConfig},
    services::telemetry::{init_telemetry, TelemetryConfig},
};
use chainops_monitor::{MonitorError, MonitorRuntime};
use chainops_storage::SeaOrmStorage;
use tracing::info;

#[tokio::main]
async fn main() -> io::Result<()> {
    if let Err(err) = bootstrap().await {
        eprintln!("[monitor] bootstrap failed: {err}");
        return Err(io::Error::other(err.to_string()));
    }

    Ok(())
}

async fn bootstrap() -> Result<(), MonitorError> {
    let storage_config = StorageConfig::load_from_env()?;
    let chain_config = ChainConfig::load_from_env()?;
    let telemetry_config = TelemetryConfig::from_env("MONITOR");
    let _telemetry = init_telemetry(&telemetry_config)?;

    let storage = Arc::new(SeaOrmStorage::connect(storage_config.database_url()).await?);
    let monitor = MonitorRuntime::new(chain_config).start(storage).await?;

    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    monitor.shutdown().await;
    Ok(())
}
