//! Static per-network RPC endpoint lists with environment overrides.

use std::collections::HashMap;

use strum::IntoEnumIterator;

use crate::config::EndpointOverrides;
use crate::model::{Endpoint, Network, Transport};
use crate::services::health::EndpointHealthCache;

fn builtin_urls(network: Network, transport: Transport) -> &'static [&'static str] {
    match (network, transport) {
        (Network::Polygon, Transport::Ws) => &[
            "wss://polygon-bor-rpc.publicnode.com",
            "wss://polygon.drpc.org",
        ],
        (Network::Polygon, Transport::Http) => &[
            "https://polygon-rpc.com",
            "https://polygon-bor-rpc.publicnode.com",
            "https://polygon.llamarpc.com",
            "https://rpc.ankr.com/polygon",
            "https://polygon.drpc.org",
        ],
        (Network::PolygonAmoy, Transport::Ws) => &["wss://polygon-amoy-bor-rpc.publicnode.com"],
        (Network::PolygonAmoy, Transport::Http) => &[
            "https://rpc-amoy.polygon.technology",
            "https://polygon-amoy-bor-rpc.publicnode.com",
            "https://polygon-amoy.drpc.org",
        ],
        (Network::Ethereum, Transport::Ws) => &["wss://ethereum-rpc.publicnode.com"],
        (Network::Ethereum, Transport::Http) => &[
            "https://ethereum-rpc.publicnode.com",
            "https://eth.llamarpc.com",
            "https://rpc.ankr.com/eth",
        ],
        (Network::Bsc, Transport::Ws) => &["wss://bsc-rpc.publicnode.com"],
        (Network::Bsc, Transport::Http) => &[
            "https://bsc-dataseed.binance.org",
            "https://bsc-rpc.publicnode.com",
            "https://rpc.ankr.com/bsc",
        ],
    }
}

/// Ordered endpoint lists per network and transport. Pure data, no I/O.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<(Network, Transport), Vec<Endpoint>>,
}

impl EndpointRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in public endpoints of every network.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for network in Network::iter() {
            for transport in [Transport::Ws, Transport::Http] {
                let urls = builtin_urls(network, transport).iter().map(|url| url.to_string());
                registry.replace(network, transport, urls);
            }
        }
        registry
    }

    /// Puts override URLs ahead of the existing entries for the same network
    /// and transport. Duplicates keep their override position.
    pub fn with_overrides(mut self, overrides: &EndpointOverrides) -> Self {
        for ((network, transport), urls) in overrides {
            let existing = self
                .endpoints
                .remove(&(*network, *transport))
                .unwrap_or_default()
                .into_iter()
                .map(|endpoint| endpoint.url);
            let merged: Vec<String> = urls.iter().cloned().chain(existing).collect();
            self.replace(*network, *transport, merged);
        }
        self
    }

    /// Replaces the list for `(network, transport)`, assigning priorities in
    /// iteration order.
    pub fn replace(
        &mut self,
        network: Network,
        transport: Transport,
        urls: impl IntoIterator<Item = String>,
    ) {
        let mut list: Vec<Endpoint> = Vec::new();
        for url in urls {
            if list.iter().any(|endpoint| endpoint.url == url) {
                continue;
            }
            let priority = list.len() as u16;
            list.push(Endpoint::new(network, transport, url, priority));
        }
        self.endpoints.insert((network, transport), list);
    }

    /// Endpoints for the pair in priority order; empty when none are
    /// configured.
    pub fn list_endpoints(&self, network: Network, transport: Transport) -> Vec<Endpoint> {
        let mut list = self
            .endpoints
            .get(&(network, transport))
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|endpoint| endpoint.priority);
        list
    }

    /// Every endpoint of the network with a fresh healthy record, fastest
    /// first.
    pub fn best_known_endpoints(
        &self,
        network: Network,
        health: &EndpointHealthCache,
    ) -> Vec<Endpoint> {
        let candidates: Vec<Endpoint> = [Transport::Ws, Transport::Http]
            .into_iter()
            .flat_map(|transport| self.list_endpoints(network, transport))
            .collect();
        health.rank_healthy(&candidates)
    }

    pub fn has_endpoints(&self, network: Network) -> bool {
        [Transport::Ws, Transport::Http]
            .into_iter()
            .any(|transport| !self.list_endpoints(network, transport).is_empty())
    }
}
