use std::time::Instant;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;

use chainops_domain::model::Network;

use super::{
    CallRequest, ChainClient, FeeSuggestion, LogFilter, LogStream, ReceiptSummary, RpcError,
};

const SIMULATED_BLOCK_SECS: u64 = 2;

/// Stand-in used outside production once every real endpoint has failed.
/// Liveness and balance reads get synthetic answers; anything that would
/// need real chain state or move funds is refused.
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    network: Network,
    started: Instant,
}

impl SimulatedClient {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl ChainClient for SimulatedClient {
    fn describe(&self) -> String {
        format!("simulated:{}", self.network)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.started.elapsed().as_secs() / SIMULATED_BLOCK_SECS)
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.network.chain_id())
    }

    async fn balance(&self, _address: Address) -> Result<U256, RpcError> {
        Ok(U256::ZERO)
    }

    async fn code_at(&self, _address: Address) -> Result<Bytes, RpcError> {
        Err(RpcError::Unsupported("eth_getCode"))
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, RpcError> {
        Ok(0)
    }

    async fn call(&self, _request: &CallRequest) -> Result<Bytes, RpcError> {
        Err(RpcError::Unsupported("eth_call"))
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64, RpcError> {
        Err(RpcError::Unsupported("eth_estimateGas"))
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, RpcError> {
        Err(RpcError::Unsupported("fee suggestion"))
    }

    async fn send_raw_transaction(&self, _raw: Bytes) -> Result<TxHash, RpcError> {
        Err(RpcError::Unsupported("eth_sendRawTransaction"))
    }

    async fn transaction_receipt(
        &self,
        _hash: TxHash,
    ) -> Result<Option<ReceiptSummary>, RpcError> {
        Err(RpcError::Unsupported("eth_getTransactionReceipt"))
    }

    async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogStream, RpcError> {
        Err(RpcError::Unsupported("log subscriptions"))
    }
}
