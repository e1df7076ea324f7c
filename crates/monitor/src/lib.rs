//! Chain-facing half of the service: resilient provider management, contract
//! event monitoring and the token distribution engine. The API crate embeds
//! it in-process; `main.rs` runs the monitoring side on its own.

pub mod connection;
pub mod contracts;
pub mod distributor;
pub mod pipeline;
pub mod rpc;
pub mod status;
pub mod subscriptions;
pub mod worker;


pub use connection::{
    ConnectionError, ConnectionManager, ConnectionMode, ConnectionSettings, ConnectionState,
    ProviderHandle, ProviderSource,
};
pub use distributor::{DistributionError, DistributionReceipt, DistributorSettings};
pub use rpc::{AlloyConnector, ChainClient, EndpointConnector, RpcError};
pub use status::{StatusReporter, StatusSnapshot};
pub use subscriptions::SubscriptionSettings;
pub use worker::{MonitorError, MonitorHandle, MonitorRuntime, MonitorStore, RestartOutcome};
