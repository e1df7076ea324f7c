//! Environment-driven configuration structures shared by all binaries.

use std::{collections::HashMap, env, fmt, str::FromStr, time::Duration};

use alloy_primitives::Address;
use thiserror::Error;

use crate::model::{parse_address, Network, Transport, DEFAULT_TOKENS_PER_USD};

const NATIVE_UNIT: u128 = 1_000_000_000_000_000_000;

/// API-specific configuration (HTTP bind + shared database) so the HTTP
/// surface does not depend on chain-only environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    database_url: String,
    api_bind_address: String,
    internal_bind_address: Option<String>,
}

impl ApiConfig {
    /// Loads only the environment variables required by the API binary.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
            api_bind_address: get_required_var("API_BIND_ADDRESS")?,
            internal_bind_address: get_optional_var("API_INTERNAL_BIND_ADDRESS"),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn api_bind_address(&self) -> &str {
        &self.api_bind_address
    }

    pub fn internal_bind_address(&self) -> Option<&str> {
        self.internal_bind_address.as_deref()
    }

    pub fn has_internal_listener(&self) -> bool {
        self.internal_bind_address.is_some()
    }
}

/// Database settings for binaries that only need the record store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    database_url: String,
}

impl StorageConfig {
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        Ok(Self {
            database_url: get_required_var("DATABASE_URL")?,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Production,
    Development,
}

impl DeploymentMode {
    pub fn is_production(self) -> bool {
        matches!(self, DeploymentMode::Production)
    }
}

/// Raw private key material. `Debug` never prints the key.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Static alert thresholds. Token thresholds are whole tokens, balance and gas
/// thresholds are wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
    pub large_distribution_tokens: u64,
    pub large_claim_tokens: u64,
    pub low_balance_wei: u128,
    pub high_gas_wei: u128,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            large_distribution_tokens: 10_000,
            large_claim_tokens: 1_000,
            low_balance_wei: NATIVE_UNIT / 10,
            high_gas_wei: NATIVE_UNIT / 20,
        }
    }
}

/// Connection and polling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTunables {
    pub rpc_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub wallet_poll_interval: Duration,
    pub aggregate_recheck_interval: Duration,
}

impl Default for ChainTunables {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 20,
            wallet_poll_interval: Duration::from_secs(60),
            aggregate_recheck_interval: Duration::from_secs(180),
        }
    }
}

/// Endpoint URLs supplied through `RPC_<NETWORK>_{WS,HTTP}_URLS`.
pub type EndpointOverrides = HashMap<(Network, Transport), Vec<String>>;

/// Contract addresses resolved from the environment. Missing entries may
/// still be filled from the record store's settings documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractAddresses {
    pub token_distributor: Option<Address>,
    pub learn2earn: Vec<Address>,
    pub service_wallet: Option<Address>,
}

/// Chain-facing configuration for the monitor and the distribution engine.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    networks: Vec<Network>,
    mode: DeploymentMode,
    signing_key: Option<SigningKey>,
    contracts: ContractAddresses,
    tokens_per_usd: u64,
    thresholds: AlertThresholds,
    tunables: ChainTunables,
    endpoint_overrides: EndpointOverrides,
}

impl ChainConfig {
    /// Loads configuration by hydrating `.env` (if present) and reading the
    /// chain variables. Malformed entries surface as `ConfigError` so
    /// binaries can respond gracefully.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        hydrate_env_file()?;

        let networks = match get_optional_var("CHAIN_NETWORKS") {
            Some(raw) => parse_networks(&raw)?,
            None => vec![Network::Polygon],
        };
        let mode = match get_optional_var("CHAINOPS_ENV") {
            Some(value) if value.eq_ignore_ascii_case("production") => DeploymentMode::Production,
            _ => DeploymentMode::Development,
        };

        let contracts = ContractAddresses {
            token_distributor: get_optional_address("TOKEN_DISTRIBUTOR_ADDRESS")?,
            learn2earn: match get_optional_var("LEARN2EARN_ADDRESSES") {
                Some(raw) => parse_address_list("LEARN2EARN_ADDRESSES", &raw)?,
                None => Vec::new(),
            },
            service_wallet: get_optional_address("SERVICE_WALLET_ADDRESS")?,
        };

        let defaults = AlertThresholds::default();
        let thresholds = AlertThresholds {
            large_distribution_tokens: get_number_or(
                "ALERT_LARGE_DISTRIBUTION_TOKENS",
                defaults.large_distribution_tokens,
            )?,
            large_claim_tokens: get_number_or(
                "ALERT_LARGE_CLAIM_TOKENS",
                defaults.large_claim_tokens,
            )?,
            low_balance_wei: get_number_or("ALERT_LOW_BALANCE_WEI", defaults.low_balance_wei)?,
            high_gas_wei: get_number_or("ALERT_HIGH_GAS_WEI", defaults.high_gas_wei)?,
        };

        let base = ChainTunables::default();
        let tunables = ChainTunables {
            rpc_timeout: Duration::from_secs(get_number_or(
                "RPC_TIMEOUT_SECS",
                base.rpc_timeout.as_secs(),
            )?),
            reconnect_delay: Duration::from_secs(get_number_or(
                "RECONNECT_DELAY_SECS",
                base.reconnect_delay.as_secs(),
            )?),
            max_reconnect_attempts: get_number_or(
                "MAX_RECONNECT_ATTEMPTS",
                base.max_reconnect_attempts,
            )?,
            wallet_poll_interval: Duration::from_secs(get_number_or(
                "WALLET_POLL_SECS",
                base.wallet_poll_interval.as_secs(),
            )?),
            aggregate_recheck_interval: Duration::from_secs(get_number_or(
                "AGGREGATE_RECHECK_SECS",
                base.aggregate_recheck_interval.as_secs(),
            )?),
        };

        let mut endpoint_overrides = EndpointOverrides::new();
        for network in &networks {
            for (transport, suffix) in [(Transport::Ws, "WS_URLS"), (Transport::Http, "HTTP_URLS")] {
                let key = format!("RPC_{}_{}", network.env_key(), suffix);
                if let Some(raw) = env::var(&key).ok().filter(|v| !v.trim().is_empty()) {
                    endpoint_overrides.insert((*network, transport), split_list(&raw));
                }
            }
        }

        let tokens_per_usd = get_number_or("TOKENS_PER_USD", DEFAULT_TOKENS_PER_USD)?;
        if tokens_per_usd == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TOKENS_PER_USD",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            networks,
            mode,
            signing_key: get_optional_var("DISTRIBUTOR_PRIVATE_KEY").map(SigningKey::new),
            contracts,
            tokens_per_usd,
            thresholds,
            tunables,
            endpoint_overrides,
        })
    }

    /// Builds a configuration in code, mostly for embedding and tests.
    pub fn new(networks: Vec<Network>, mode: DeploymentMode) -> Self {
        Self {
            networks,
            mode,
            signing_key: None,
            contracts: ContractAddresses::default(),
            tokens_per_usd: DEFAULT_TOKENS_PER_USD,
            thresholds: AlertThresholds::default(),
            tunables: ChainTunables::default(),
            endpoint_overrides: EndpointOverrides::new(),
        }
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_contracts(mut self, contracts: ContractAddresses) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_tunables(mut self, tunables: ChainTunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn with_endpoint_overrides(mut self, overrides: EndpointOverrides) -> Self {
        self.endpoint_overrides = overrides;
        self
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Network used for distribution and contract monitoring.
    pub fn primary_network(&self) -> Network {
        self.networks.first().copied().unwrap_or(Network::Polygon)
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.signing_key.as_ref()
    }

    pub fn contracts(&self) -> &ContractAddresses {
        &self.contracts
    }

    pub fn tokens_per_usd(&self) -> u64 {
        self.tokens_per_usd
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn tunables(&self) -> ChainTunables {
        self.tunables
    }

    pub fn endpoint_overrides(&self) -> &EndpointOverrides {
        &self.endpoint_overrides
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_networks(raw: &str) -> Result<Vec<Network>, ConfigError> {
    let mut networks = Vec::new();
    for item in split_list(raw) {
        let network = Network::from_str(&item).map_err(|_| ConfigError::InvalidValue {
            key: "CHAIN_NETWORKS",
            reason: format!("unknown network `{item}`"),
        })?;
        if !networks.contains(&network) {
            networks.push(network);
        }
    }
    if networks.is_empty() {
        return Err(ConfigError::MissingVar {
            key: "CHAIN_NETWORKS",
        });
    }
    Ok(networks)
}

/// Parses a comma separated address list, reporting `key` on failure.
pub fn parse_address_list(key: &'static str, raw: &str) -> Result<Vec<Address>, ConfigError> {
    split_list(raw)
        .iter()
        .map(|item| {
            parse_address(item).map_err(|_| ConfigError::InvalidAddress {
                key,
                value: item.clone(),
            })
        })
        .collect()
}

fn get_optional_address(key: &'static str) -> Result<Option<Address>, ConfigError> {
    get_optional_var(key)
        .map(|value| {
            parse_address(&value).map_err(|_| ConfigError::InvalidAddress { key, value })
        })
        .transpose()
}

fn get_number_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    match get_optional_var(key) {
        Some(value) => value
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { key, source }),
        None => Ok(default),
    }
}

fn get_required_var(key: &'static str) -> Result<String, ConfigError> {
    get_optional_var(key).ok_or(ConfigError::MissingVar { key })
}

fn get_optional_var(key: &'static str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn hydrate_env_file() -> Result<(), ConfigError> {
    if env::var_os("CHAINOPS_SKIP_DOTENV").is_some() {
        return Ok(());
    }
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ConfigError::Dotenv { source: err }),
    }

    Ok(())
}

/// Errors emitted when `.env` hydration or environment parsing fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable `{key}`")]
    MissingVar { key: &'static str },
    #[error("invalid integer in `{key}`: {source}")]
    InvalidNumber {
        key: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid address `{value}` in `{key}`")]
    InvalidAddress { key: &'static str, value: String },
    #[error("invalid value in `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to load .env file: {source}")]
    Dotenv {
        #[from]
        source: dotenvy::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_GUARD: Mutex<()> = Mutex::new(());

    const CHAIN_KEYS: &[&str] = &[
        "CHAIN_NETWORKS",
        "CHAINOPS_ENV",
        "DISTRIBUTOR_PRIVATE_KEY",
        "TOKEN_DISTRIBUTOR_ADDRESS",
        "LEARN2EARN_ADDRESSES",
        "SERVICE_WALLET_ADDRESS",
        "TOKENS_PER_USD",
        "MAX_RECONNECT_ATTEMPTS",
        "RPC_POLYGON_WS_URLS",
        "RPC_POLYGON_HTTP_URLS",
    ];

    fn set_env() {
        std::env::set_var("CHAINOPS_SKIP_DOTENV", "1");
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        std::env::set_var("API_BIND_ADDRESS", "127.0.0.1:8080");
        std::env::remove_var("API_INTERNAL_BIND_ADDRESS");
        for key in CHAIN_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn api_config_only_requires_api_env() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("DATABASE_URL", "sqlite://api-only.db");
        std::env::set_var("API_BIND_ADDRESS", "127.0.0.1:9999");

        let config = ApiConfig::load_from_env().expect("api config loads");
        assert_eq!(config.database_url(), "sqlite://api-only.db");
        assert_eq!(config.api_bind_address(), "127.0.0.1:9999");
        assert!(!config.has_internal_listener());

        set_env();
    }

    #[test]
    fn empty_required_env_var_is_treated_as_missing() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("DATABASE_URL", "   ");

        let err = ApiConfig::load_from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingVar {
                key: "DATABASE_URL"
            }
        ));

        set_env();
    }

    #[test]
    fn chain_config_defaults_to_polygon_development() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();

        let config = ChainConfig::load_from_env().expect("chain config loads");
        assert_eq!(config.networks(), &[Network::Polygon]);
        assert_eq!(config.mode(), DeploymentMode::Development);
        assert_eq!(config.tokens_per_usd(), DEFAULT_TOKENS_PER_USD);
        assert!(config.signing_key().is_none());
        assert_eq!(config.tunables().max_reconnect_attempts, 20);
        assert!(config.endpoint_overrides().is_empty());
    }

    #[test]
    fn chain_config_reads_networks_contracts_and_overrides() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();
        std::env::set_var("CHAIN_NETWORKS", "amoy, polygon, amoy");
        std::env::set_var("CHAINOPS_ENV", "Production");
        std::env::set_var(
            "TOKEN_DISTRIBUTOR_ADDRESS",
            "0x52908400098527886e0f7030069857d2e4169ee7",
        );
        std::env::set_var(
            "LEARN2EARN_ADDRESSES",
            "0x52908400098527886e0f7030069857d2e4169ee7, 0x8617e340b3d01fa5f11f306f4090fd50e238070d",
        );
        std::env::set_var("RPC_POLYGON_HTTP_URLS", "https://a.example, https://b.example");
        std::env::set_var("MAX_RECONNECT_ATTEMPTS", "3");
        std::env::set_var("DISTRIBUTOR_PRIVATE_KEY", "0xsecret");

        let config = ChainConfig::load_from_env().expect("chain config loads");
        assert_eq!(config.networks(), &[Network::PolygonAmoy, Network::Polygon]);
        assert_eq!(config.primary_network(), Network::PolygonAmoy);
        assert!(config.mode().is_production());
        assert!(config.contracts().token_distributor.is_some());
        assert_eq!(config.contracts().learn2earn.len(), 2);
        assert_eq!(
            config.endpoint_overrides()[&(Network::Polygon, Transport::Http)],
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.tunables().max_reconnect_attempts, 3);
        assert_eq!(
            format!("{:?}", config.signing_key().unwrap()),
            "SigningKey(<redacted>)"
        );

        set_env();
    }

    #[test]
    fn chain_config_rejects_bad_values() {
        let _guard = ENV_GUARD.lock().unwrap();
        set_env();

        std::env::set_var("SERVICE_WALLET_ADDRESS", "not-an-address");
        assert!(matches!(
            ChainConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidAddress {
                key: "SERVICE_WALLET_ADDRESS",
                ..
            }
        ));
        std::env::remove_var("SERVICE_WALLET_ADDRESS");

        std::env::set_var("CHAIN_NETWORKS", "solana");
        assert!(matches!(
            ChainConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidValue {
                key: "CHAIN_NETWORKS",
                ..
            }
        ));
        std::env::remove_var("CHAIN_NETWORKS");

        std::env::set_var("TOKENS_PER_USD", "twenty");
        assert!(matches!(
            ChainConfig::load_from_env().unwrap_err(),
            ConfigError::InvalidNumber {
                key: "TOKENS_PER_USD",
                ..
            }
        ));

        set_env();
    }
}
