//! Chain access behind one trait so the connection manager, the listeners and
//! the distribution engine never touch a concrete transport.

use std::{future::Future, sync::Arc, time::Duration};

use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use chainops_domain::model::Endpoint;

mod aggregate;
#[cfg(test)]
pub(crate) mod mock;
mod provider;
mod simulated;

pub use aggregate::AggregateClient;
pub use provider::{AlloyClient, AlloyConnector};
pub use simulated::SimulatedClient;

/// Read-only contract call or gas estimation input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub input: Bytes,
}

impl CallRequest {
    pub fn new(to: Address, input: impl Into<Bytes>) -> Self {
        Self {
            from: None,
            to,
            input: input.into(),
        }
    }

    pub fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }
}

/// Fee data as suggested by the node, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSuggestion {
    pub gas_price: u128,
    pub max_priority_fee: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// Logs emitted by `address` whose first topic is any of `topics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub topics: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub tx_hash: Option<TxHash>,
}

/// Never-ending (until the transport drops) stream of matching logs.
pub type LogStream = BoxStream<'static, ChainLog>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
}

impl RpcError {
    /// The node executed the call and reported a revert.
    pub fn is_revert(&self) -> bool {
        match self {
            RpcError::Rejected { code, message } => {
                *code == 3 || message.to_ascii_lowercase().contains("revert")
            }
            _ => false,
        }
    }

    /// Errors that say nothing about the endpoint's health.
    pub fn is_answer(&self) -> bool {
        matches!(self, RpcError::Rejected { .. } | RpcError::Unsupported(_))
    }
}

/// Runs `fut` under `limit`, mapping expiry to [`RpcError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RpcError::Timeout(limit))?
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Human readable origin used in logs and status output.
    fn describe(&self) -> String;
    async fn block_number(&self) -> Result<u64, RpcError>;
    async fn chain_id(&self) -> Result<u64, RpcError>;
    async fn balance(&self, address: Address) -> Result<U256, RpcError>;
    async fn code_at(&self, address: Address) -> Result<Bytes, RpcError>;
    /// Pending transaction count, i.e. the next usable nonce.
    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError>;
    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError>;
    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError>;
    async fn fee_suggestion(&self) -> Result<FeeSuggestion, RpcError>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError>;
    async fn transaction_receipt(&self, hash: TxHash)
        -> Result<Option<ReceiptSummary>, RpcError>;
    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, RpcError>;
}

/// Opens a client for one endpoint. Implementations do not probe liveness;
/// the connection manager does.
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ChainClient>, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_detection_uses_code_and_message() {
        let by_code = RpcError::Rejected {
            code: 3,
            message: "0x".into(),
        };
        let by_message = RpcError::Rejected {
            code: -32000,
            message: "execution reverted: paused".into(),
        };
        let other = RpcError::Rejected {
            code: -32000,
            message: "nonce too low".into(),
        };
        assert!(by_code.is_revert());
        assert!(by_message.is_revert());
        assert!(!other.is_revert());
        assert!(!RpcError::Transport("eof".into()).is_revert());
    }

    #[tokio::test]
    async fn timeout_maps_to_rpc_error() {
        let limit = Duration::from_millis(10);
        let result: Result<(), RpcError> = with_timeout(limit, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(RpcError::Timeout(limit)));
    }
}
