use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use metrics::counter;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chainops_domain::{
    config::{parse_address_list, ChainConfig, ConfigError, ContractAddresses},
    model::{AlertEvent, AlertKind, MonitorKind, MonitorTarget, Network, Severity},
    services::{telemetry::TelemetryError, EndpointHealthCache, EndpointRegistry},
    storage::{AuditSink, DistributionStore, SettingsStore, StorageError},
};

use crate::{
    connection::{
        ConnectionError, ConnectionManager, ConnectionMode, ConnectionSettings, ProviderHandle,
        ProviderSource,
    },
    contracts::{learn2earn_claimed_signature, tokens_distributed_signature},
    distributor::{
        DistributionError, DistributionReceipt, DistributionSigner, DistributorSettings,
        TokenDistributor,
    },
    pipeline::EventPipeline,
    rpc::{AlloyConnector, EndpointConnector},
    status::{StatusReporter, StatusSnapshot, StatusUpdate},
    subscriptions::{SubscriptionError, SubscriptionManager, SubscriptionSettings},
};

/// Settings document keys consulted when an address is not in the
/// environment.
pub const TOKEN_DISTRIBUTOR_SETTING: &str = "token_distributor_address";
pub const LEARN2EARN_SETTING: &str = "learn2earn_addresses";
pub const SERVICE_WALLET_SETTING: &str = "service_wallet_address";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Result of an operator-triggered restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub success: bool,
    pub message: String,
}

/// Everything the monitor needs from the record store.
pub trait MonitorStore: DistributionStore + AuditSink + SettingsStore + 'static {}

impl<T> MonitorStore for T where T: DistributionStore + AuditSink + SettingsStore + 'static {}

/// Builder for the in-process monitor: connection manager, listeners, the
/// distribution engine and the status reporter.
pub struct MonitorRuntime {
    config: ChainConfig,
    connector: Arc<dyn EndpointConnector>,
    registry: Option<EndpointRegistry>,
    connection_settings: Option<ConnectionSettings>,
    subscription_settings: Option<SubscriptionSettings>,
    distributor_settings: Option<DistributorSettings>,
}

impl MonitorRuntime {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            connector: Arc::new(AlloyConnector),
            registry: None,
            connection_settings: None,
            subscription_settings: None,
            distributor_settings: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn EndpointConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Replaces the built-in endpoint lists (plus environment overrides).
    pub fn with_registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection_settings = Some(settings);
        self
    }

    pub fn with_subscription_settings(mut self, settings: SubscriptionSettings) -> Self {
        self.subscription_settings = Some(settings);
        self
    }

    pub fn with_distributor_settings(mut self, settings: DistributorSettings) -> Self {
        self.distributor_settings = Some(settings);
        self
    }

    /// Connects, attaches the listeners and starts the supervisor. In
    /// production a total connection failure or a token distribution target
    /// that cannot attach is returned as an error.
    pub async fn start<S: MonitorStore>(self, storage: Arc<S>) -> Result<MonitorHandle, MonitorError> {
        let config = self.config;
        let network = config.primary_network();
        let tunables = config.tunables();

        let contracts = resolve_contracts(config.contracts(), storage.as_ref()).await?;
        let registry = self.registry.unwrap_or_else(|| {
            EndpointRegistry::builtin().with_overrides(config.endpoint_overrides())
        });
        if !registry.has_endpoints(network) {
            warn!(%network, "no rpc endpoints configured");
        }

        let reporter = StatusReporter::new();
        let status = reporter.handle();
        let connection = ConnectionManager::new(
            network,
            config.mode(),
            registry,
            EndpointHealthCache::default(),
            self.connector,
            self.connection_settings.unwrap_or_else(|| tunables.into()),
        );
        reporter.watch_connection(connection.subscribe());
        let source: Arc<dyn ProviderSource> = Arc::new(connection.clone());

        let pipeline = Arc::new(EventPipeline::new(
            storage.clone(),
            network,
            config.thresholds(),
            status.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            pipeline.clone(),
            source.clone(),
            self.subscription_settings.unwrap_or(SubscriptionSettings {
                probe_timeout: tunables.rpc_timeout,
                wallet_poll_interval: tunables.wallet_poll_interval,
            }),
        ));

        status.apply(StatusUpdate::Totals(storage.distribution_totals().await?));

        let distributor_settings = self.distributor_settings.unwrap_or(DistributorSettings {
            tokens_per_usd: config.tokens_per_usd(),
            rpc_timeout: tunables.rpc_timeout,
            ..DistributorSettings::default()
        });
        let distributor = match (config.signing_key(), contracts.token_distributor) {
            (None, _) => {
                info!("no signing key configured; token distribution disabled");
                None
            }
            (Some(_), None) => {
                warn!("signing key present but no token distributor address; distribution disabled");
                status.error("token distributor address not configured");
                None
            }
            (Some(key), Some(contract)) => match DistributionSigner::from_key(key) {
                Ok(signer) => {
                    info!(
                        %network,
                        signer = %signer.address(),
                        contract = %contract,
                        "token distribution enabled"
                    );
                    Some(Arc::new(TokenDistributor::new(
                        network,
                        contract,
                        signer,
                        source.clone(),
                        storage.clone(),
                        storage.clone(),
                        status.clone(),
                        distributor_settings,
                    )))
                }
                Err(err) => {
                    error!(error = %err, "invalid signing key; distribution disabled");
                    status.error(format!("distribution disabled: {err}"));
                    None
                }
            },
        };

        let targets = build_targets(network, &contracts);
        let handle = match connection.connect().await {
            Ok(handle) => handle,
            Err(err) => {
                connection.shutdown();
                return Err(err.into());
            }
        };
        if let Err(err) = subscriptions.attach(&handle, &targets).await {
            error!(error = %err, "critical monitor failed to attach");
            subscriptions.detach().await;
            connection.shutdown();
            return Err(err.into());
        }
        status.apply(StatusUpdate::Initialized(true));

        let inner = Arc::new(RuntimeInner {
            network,
            connection,
            subscriptions,
            pipeline,
            targets,
            distributor,
            reporter,
            supervisor: Mutex::new(None),
        });
        inner.alert_on_fallback(&handle).await;
        let supervisor = tokio::spawn(supervise(inner.clone(), handle.generation));
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        info!(%network, mode = %handle.mode, "monitor started");
        Ok(MonitorHandle { inner })
    }
}

struct RuntimeInner {
    network: Network,
    connection: ConnectionManager,
    subscriptions: Arc<SubscriptionManager>,
    pipeline: Arc<EventPipeline>,
    targets: Vec<MonitorTarget>,
    distributor: Option<Arc<TokenDistributor>>,
    reporter: StatusReporter,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeInner {
    async fn reattach(&self, handle: &ProviderHandle) -> Result<(), SubscriptionError> {
        match self.subscriptions.attach(handle, &self.targets).await {
            Ok(report) => {
                info!(
                    generation = report.generation,
                    active = report.active.len(),
                    failed = report.failed.len(),
                    "monitors attached"
                );
                Ok(())
            }
            Err(err) => {
                error!(generation = handle.generation, error = %err, "monitor re-attach failed");
                Err(err)
            }
        }
    }

    async fn alert_on_fallback(&self, handle: &ProviderHandle) {
        if handle.mode == ConnectionMode::Ws {
            return;
        }
        let alert = AlertEvent::new(
            AlertKind::ProviderFallback,
            Severity::Warning,
            json!({
                "network": self.network,
                "mode": handle.mode,
                "endpoint": handle.client.describe(),
                "generation": handle.generation,
            }),
        );
        if let Err(err) = self.pipeline.raise(alert).await {
            warn!(error = %err, "failed to record fallback alert");
        }
    }
}

/// Re-attaches listeners whenever the connection manager publishes a new
/// provider generation.
async fn supervise(inner: Arc<RuntimeInner>, mut attached: u64) {
    let mut updates = inner.connection.subscribe();
    let mut last_mode = inner
        .connection
        .snapshot()
        .provider
        .map(|handle| handle.mode);
    while updates.changed().await.is_ok() {
        let Some(handle) = updates.borrow_and_update().provider.clone() else {
            continue;
        };
        if handle.generation == attached {
            continue;
        }
        if inner.subscriptions.attached_generation().await == Some(handle.generation) {
            attached = handle.generation;
            continue;
        }

        counter!("monitor_reattach_total").increment(1);
        if inner.reattach(&handle).await.is_ok() {
            attached = handle.generation;
        }
        if last_mode != Some(handle.mode) {
            inner.alert_on_fallback(&handle).await;
            last_mode = Some(handle.mode);
        }
    }
}

/// Handle to a running monitor. Cheap to clone.
#[derive(Clone)]
pub struct MonitorHandle {
    inner: Arc<RuntimeInner>,
}

impl MonitorHandle {
    pub fn network(&self) -> Network {
        self.inner.network
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.reporter.snapshot()
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.inner.reporter
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub fn distribution_enabled(&self) -> bool {
        self.inner.distributor.is_some()
    }

    /// Runs a confirmed distribution.
    /// Runs a distribution. With `confirm` unset the call returns once the
    /// node accepted the transaction.
    pub async fn distribute(
        &self,
        donor: &str,
        usd_value: f64,
        confirm: bool,
    ) -> Result<DistributionReceipt, DistributionError> {
        match &self.inner.distributor {
            Some(distributor) => distributor.distribute(donor, usd_value, confirm).await,
            None => Err(DistributionError::Unavailable(
                "token distribution is not configured".into(),
            )),
        }
    }

    /// Clears the sticky HTTP fallback and reconnect counter, reconnects and
    /// re-attaches every monitor.
    pub async fn restart(&self) -> RestartOutcome {
        let status = self.inner.reporter.handle();
        let handle = match self.inner.connection.restart().await {
            Ok(handle) => handle,
            Err(err) => {
                status.error(format!("restart failed: {err}"));
                return RestartOutcome {
                    success: false,
                    message: err.to_string(),
                };
            }
        };

        match self.inner.reattach(&handle).await {
            Ok(()) => RestartOutcome {
                success: true,
                message: format!(
                    "monitoring restarted on {} ({})",
                    handle.mode,
                    handle.client.describe()
                ),
            },
            Err(err) => {
                status.error(format!("restart failed: {err}"));
                RestartOutcome {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.subscriptions.detach().await;
        self.inner.connection.shutdown();
        info!(network = %self.inner.network, "monitor stopped");
    }
}

/// Fills addresses missing from the environment from the settings documents.
async fn resolve_contracts<S: SettingsStore + ?Sized>(
    configured: &ContractAddresses,
    settings: &S,
) -> Result<ContractAddresses, MonitorError> {
    let mut resolved = configured.clone();
    if resolved.token_distributor.is_none() {
        resolved.token_distributor = setting_addresses(settings, TOKEN_DISTRIBUTOR_SETTING)
            .await?
            .into_iter()
            .next();
    }
    if resolved.learn2earn.is_empty() {
        resolved.learn2earn = setting_addresses(settings, LEARN2EARN_SETTING).await?;
    }
    if resolved.service_wallet.is_none() {
        resolved.service_wallet = setting_addresses(settings, SERVICE_WALLET_SETTING)
            .await?
            .into_iter()
            .next();
    }
    Ok(resolved)
}

async fn setting_addresses<S: SettingsStore + ?Sized>(
    settings: &S,
    key: &'static str,
) -> Result<Vec<alloy::primitives::Address>, MonitorError> {
    match settings.setting(key).await? {
        Some(raw) => Ok(parse_address_list(key, &raw)?),
        None => Ok(Vec::new()),
    }
}

/// One target per resolved address on the primary network.
pub fn build_targets(network: Network, contracts: &ContractAddresses) -> Vec<MonitorTarget> {
    let mut targets = Vec::new();
    if let Some(address) = contracts.token_distributor {
        targets.push(MonitorTarget {
            contract_address: address,
            network,
            event_signatures: vec![tokens_distributed_signature()],
            kind: MonitorKind::TokenDistribution,
        });
    }
    for address in &contracts.learn2earn {
        targets.push(MonitorTarget {
            contract_address: *address,
            network,
            event_signatures: vec![learn2earn_claimed_signature()],
            kind: MonitorKind::Learn2earn,
        });
    }
    if let Some(address) = contracts.service_wallet {
        targets.push(MonitorTarget {
            contract_address: address,
            network,
            event_signatures: Vec::new(),
            kind: MonitorKind::Wallet,
        });
    }
    targets
}

/// Polls until the supervisor has caught up with the latest generation.
/// Used by callers that need listeners in place before continuing.
pub async fn wait_until_attached(handle: &MonitorHandle, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let current = handle.inner.connection.snapshot().generation;
        if handle.inner.subscriptions.attached_generation().await == Some(current) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MemoryStore;
    use alloy::primitives::address;

    #[tokio::test]
    async fn settings_documents_fill_missing_addresses() {
        let store = MemoryStore::new();
        store
            .put_setting(
                LEARN2EARN_SETTING,
                "0x1111111111111111111111111111111111111111, 0x2222222222222222222222222222222222222222",
            )
            .await
            .unwrap();
        store
            .put_setting(
                TOKEN_DISTRIBUTOR_SETTING,
                "0x3333333333333333333333333333333333333333",
            )
            .await
            .unwrap();
        let configured = ContractAddresses {
            token_distributor: Some(address!("4444444444444444444444444444444444444444")),
            ..ContractAddresses::default()
        };

        let resolved = resolve_contracts(&configured, store.as_ref()).await.unwrap();
        assert_eq!(
            resolved.token_distributor,
            Some(address!("4444444444444444444444444444444444444444"))
        );
        assert_eq!(resolved.learn2earn.len(), 2);
        assert_eq!(resolved.service_wallet, None);

        let targets = build_targets(Network::Polygon, &resolved);
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].kind, MonitorKind::TokenDistribution);
    }

    #[tokio::test]
    async fn malformed_setting_is_a_config_error() {
        let store = MemoryStore::new();
        store
            .put_setting(SERVICE_WALLET_SETTING, "not-an-address")
            .await
            .unwrap();
        let err = resolve_contracts(&ContractAddresses::default(), store.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Config(ConfigError::InvalidAddress { .. })
        ));
    }
}
