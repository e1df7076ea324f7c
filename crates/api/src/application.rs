use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use chainops_domain::config::{ApiConfig, ChainConfig, ConfigError};
use chainops_domain::services::telemetry::{init_telemetry, TelemetryConfig, TelemetryError};
use chainops_domain::storage::StorageError;
use chainops_monitor::{MonitorError, MonitorRuntime};
use chainops_storage::SeaOrmStorage;
use thiserror::Error;
use tracing::info;

use crate::{
    handlers::{distribute_handler, metrics_handler, restart_handler, status_handler},
    state::AppState,
};

/// Public routes. Metrics and restart join them only when no internal
/// listener is configured.
pub fn configure_public(cfg: &mut web::ServiceConfig, include_internal: bool) {
    cfg.route(
        "/api/v1/monitoring/status",
        web::get().to(status_handler),
    )
    .route("/api/v1/distributions", web::post().to(distribute_handler));
    if include_internal {
        configure_internal(cfg);
    }
}

pub fn configure_internal(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_handler)).route(
        "/api/v1/monitoring/restart",
        web::post().to(restart_handler),
    );
}

pub async fn run() -> Result<(), BootstrapError> {
    let config = ApiConfig::load_from_env()?;
    let chain_config = ChainConfig::load_from_env()?;
    let telemetry = init_telemetry(&TelemetryConfig::from_env("API"))?;

    let storage = Arc::new(SeaOrmStorage::connect(config.database_url()).await?);
    let monitor = MonitorRuntime::new(chain_config).start(storage).await?;
    let state = AppState::new(monitor.clone(), telemetry);

    let split_internal = config.has_internal_listener();
    let public_state = state.clone();
    let public_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(public_state.clone()))
            .wrap(Logger::default())
            .configure(|cfg| configure_public(cfg, !split_internal))
    })
    .bind(config.api_bind_address())?
    .run();
    info!(address = config.api_bind_address(), "public listener bound");

    let internal_server = match config.internal_bind_address() {
        Some(address) => {
            let internal_state = state.clone();
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(internal_state.clone()))
                    .wrap(Logger::default())
                    .configure(configure_internal)
            })
            .bind(address)?
            .run();
            info!(address, "internal listener bound");
            Some(server)
        }
        None => None,
    };

    let served = match internal_server {
        Some(internal) => tokio::try_join!(public_server, internal).map(|_| ()),
        None => public_server.await,
    };
    monitor.shutdown().await;
    served?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
