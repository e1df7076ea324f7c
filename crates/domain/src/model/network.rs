use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

const GWEI: u128 = 1_000_000_000;

/// Chains the operational layer knows how to reach.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Network {
    Polygon,
    #[strum(to_string = "polygon_amoy", serialize = "amoy")]
    PolygonAmoy,
    Ethereum,
    #[strum(to_string = "bsc", serialize = "binance")]
    Bsc,
}

impl Network {
    pub fn chain_id(self) -> u64 {
        match self {
            Network::Polygon => 137,
            Network::PolygonAmoy => 80_002,
            Network::Ethereum => 1,
            Network::Bsc => 56,
        }
    }

    /// Upper-case fragment used in per-network environment keys, e.g.
    /// `RPC_POLYGON_AMOY_HTTP_URLS`.
    pub fn env_key(self) -> &'static str {
        match self {
            Network::Polygon => "POLYGON",
            Network::PolygonAmoy => "POLYGON_AMOY",
            Network::Ethereum => "ETHEREUM",
            Network::Bsc => "BSC",
        }
    }

    /// Priority-fee floor enforced by the network's validators. Polygon nodes
    /// drop transactions priced under it.
    pub fn min_priority_fee_wei(self) -> u128 {
        match self {
            Network::Polygon => 30 * GWEI,
            Network::PolygonAmoy => 25 * GWEI,
            Network::Ethereum | Network::Bsc => 0,
        }
    }

    pub fn native_symbol(self) -> &'static str {
        match self {
            Network::Polygon | Network::PolygonAmoy => "POL",
            Network::Ethereum => "ETH",
            Network::Bsc => "BNB",
        }
    }

    pub fn is_testnet(self) -> bool {
        matches!(self, Network::PolygonAmoy)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Transport {
    Ws,
    Http,
}

/// One configured RPC endpoint. Lower `priority` values are tried first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub network: Network,
    pub transport: Transport,
    pub url: String,
    pub priority: u16,
}

impl Endpoint {
    pub fn new(network: Network, transport: Transport, url: impl Into<String>, priority: u16) -> Self {
        Self {
            network,
            transport,
            url: url.into(),
            priority,
        }
    }
}
