use std::{future::Future, sync::Arc, time::Duration, time::Instant};

use alloy::primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};

use chainops_domain::services::EndpointHealthCache;

use super::{
    with_timeout, CallRequest, ChainClient, FeeSuggestion, LogFilter, LogStream, ReceiptSummary,
    RpcError,
};

/// Quorum-1 fan-over: members are asked in order and the first answer wins.
/// Timeouts and transport errors count against the member in the health
/// cache; a JSON-RPC error is an answer and is returned as-is.
pub struct AggregateClient {
    members: Vec<Arc<dyn ChainClient>>,
    health: EndpointHealthCache,
    timeout: Duration,
}

impl AggregateClient {
    pub fn new(
        members: Vec<Arc<dyn ChainClient>>,
        health: EndpointHealthCache,
        timeout: Duration,
    ) -> Self {
        Self {
            members,
            health,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    async fn first_answer<T, F, Fut>(&self, op: &'static str, run: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut last_error = RpcError::Transport("aggregate has no members".to_string());
        for member in &self.members {
            let started = Instant::now();
            match with_timeout(self.timeout, run(member.clone())).await {
                Ok(value) => {
                    self.health.record_health(
                        &member.describe(),
                        started.elapsed().as_millis() as u64,
                        true,
                    );
                    return Ok(value);
                }
                Err(err) if err.is_answer() => return Err(err),
                Err(err) => {
                    warn!(endpoint = %member.describe(), op, error = %err, "aggregate member failed");
                    counter!("rpc_aggregate_member_failures_total", "op" => op).increment(1);
                    self.health.record_health(&member.describe(), 0, false);
                    last_error = err;
                }
            }
        }
        debug!(op, members = self.members.len(), "every aggregate member failed");
        Err(last_error)
    }
}

#[async_trait]
impl ChainClient for AggregateClient {
    fn describe(&self) -> String {
        let urls: Vec<String> = self.members.iter().map(|m| m.describe()).collect();
        format!("aggregate[{}]", urls.join(","))
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.first_answer("block_number", |client| async move {
            client.block_number().await
        })
        .await
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.first_answer("chain_id", |client| async move { client.chain_id().await })
            .await
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.first_answer("balance", |client| async move {
            client.balance(address).await
        })
        .await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, RpcError> {
        self.first_answer("code_at", |client| async move {
            client.code_at(address).await
        })
        .await
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        self.first_answer("transaction_count", |client| async move {
            client.transaction_count(address).await
        })
        .await
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.first_answer("call", |client| {
            let request = request.clone();
            async move { client.call(&request).await }
        })
        .await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
        self.first_answer("estimate_gas", |client| {
            let request = request.clone();
            async move { client.estimate_gas(&request).await }
        })
        .await
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, RpcError> {
        self.first_answer("fee_suggestion", |client| async move {
            client.fee_suggestion().await
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError> {
        self.first_answer("send_raw_transaction", |client| {
            let raw = raw.clone();
            async move { client.send_raw_transaction(raw).await }
        })
        .await
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<ReceiptSummary>, RpcError> {
        self.first_answer("transaction_receipt", |client| async move {
            client.transaction_receipt(hash).await
        })
        .await
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, RpcError> {
        self.first_answer("subscribe_logs", |client| {
            let filter = filter.clone();
            async move { client.subscribe_logs(&filter).await }
        })
        .await
    }
}
