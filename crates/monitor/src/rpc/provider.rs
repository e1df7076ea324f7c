use std::sync::Arc;

use alloy::{
    network::{ReceiptResponse as _, TransactionBuilder},
    primitives::{Address, Bytes, TxHash, U256},
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log, TransactionRequest},
    transports::TransportError,
};
use async_trait::async_trait;
use futures::StreamExt;

use chainops_domain::model::{Endpoint, Transport};

use super::{
    CallRequest, ChainClient, ChainLog, EndpointConnector, FeeSuggestion, LogFilter, LogStream,
    ReceiptSummary, RpcError,
};

/// One endpoint behind an alloy provider. WebSocket endpoints push logs over
/// `eth_subscribe`; HTTP endpoints poll an installed log filter.
pub struct AlloyClient {
    endpoint: Endpoint,
    provider: DynProvider,
}

impl AlloyClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, RpcError> {
        let provider = match endpoint.transport {
            Transport::Http => {
                let url = endpoint.url.parse().map_err(|err| {
                    RpcError::Transport(format!("invalid url `{}`: {err}", endpoint.url))
                })?;
                ProviderBuilder::new().connect_http(url).erased()
            }
            Transport::Ws => ProviderBuilder::new()
                .connect_ws(WsConnect::new(endpoint.url.clone()))
                .await
                .map_err(map_transport_error)?
                .erased(),
        };

        Ok(Self {
            endpoint: endpoint.clone(),
            provider,
        })
    }
}

fn map_transport_error(err: TransportError) -> RpcError {
    if let Some(payload) = err.as_error_resp() {
        return RpcError::Rejected {
            code: payload.code,
            message: payload.message.to_string(),
        };
    }
    RpcError::Transport(err.to_string())
}

fn to_request(request: &CallRequest) -> TransactionRequest {
    let tx = TransactionRequest::default()
        .with_to(request.to)
        .with_input(request.input.clone());
    match request.from {
        Some(from) => tx.with_from(from),
        None => tx,
    }
}

fn to_filter(filter: &LogFilter) -> Filter {
    Filter::new()
        .address(filter.address)
        .event_signature(filter.topics.clone())
}

fn to_chain_log(log: Log) -> ChainLog {
    ChainLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number: log.block_number,
        tx_hash: log.transaction_hash,
    }
}

#[async_trait]
impl ChainClient for AlloyClient {
    fn describe(&self) -> String {
        self.endpoint.url.clone()
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.provider
            .get_block_number()
            .await
            .map_err(map_transport_error)
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.provider.get_chain_id().await.map_err(map_transport_error)
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(map_transport_error)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, RpcError> {
        self.provider
            .get_code_at(address)
            .await
            .map_err(map_transport_error)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(map_transport_error)
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.provider
            .call(to_request(request))
            .await
            .map_err(map_transport_error)
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
        self.provider
            .estimate_gas(to_request(request))
            .await
            .map_err(map_transport_error)
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, RpcError> {
        let gas_price = self
            .provider
            .get_gas_price()
            .await
            .map_err(map_transport_error)?;
        let max_priority_fee = self
            .provider
            .get_max_priority_fee_per_gas()
            .await
            .map_err(map_transport_error)?;
        Ok(FeeSuggestion {
            gas_price,
            max_priority_fee,
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError> {
        let pending = self
            .provider
            .send_raw_transaction(&raw)
            .await
            .map_err(map_transport_error)?;
        Ok(*pending.tx_hash())
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<ReceiptSummary>, RpcError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(map_transport_error)?;
        Ok(receipt.map(|receipt| ReceiptSummary {
            tx_hash: receipt.transaction_hash,
            success: receipt.status(),
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }))
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, RpcError> {
        let filter = to_filter(filter);
        match self.endpoint.transport {
            Transport::Ws => {
                let subscription = self
                    .provider
                    .subscribe_logs(&filter)
                    .await
                    .map_err(map_transport_error)?;
                Ok(subscription.into_stream().map(to_chain_log).boxed())
            }
            Transport::Http => {
                let poller = self
                    .provider
                    .watch_logs(&filter)
                    .await
                    .map_err(map_transport_error)?;
                Ok(poller
                    .into_stream()
                    .flat_map(|batch| futures::stream::iter(batch.into_iter().map(to_chain_log)))
                    .boxed())
            }
        }
    }
}

/// Production connector: one [`AlloyClient`] per endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlloyConnector;

#[async_trait]
impl EndpointConnector for AlloyConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ChainClient>, RpcError> {
        Ok(Arc::new(AlloyClient::connect(endpoint).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use chainops_domain::model::Network;

    #[tokio::test]
    async fn rejects_malformed_http_urls() {
        let endpoint = Endpoint::new(Network::Polygon, Transport::Http, "not a url", 0);
        let err = AlloyClient::connect(&endpoint).await.err().expect("bad url");
        assert!(matches!(err, RpcError::Transport(message) if message.contains("not a url")));
    }

    #[test]
    fn call_requests_carry_sender_when_present() {
        let to = address!("52908400098527886e0f7030069857d2e4169ee7");
        let from = address!("8617e340b3d01fa5f11f306f4090fd50e238070d");
        let tx = to_request(&CallRequest::new(to, vec![1u8, 2]).with_from(from));
        assert_eq!(tx.from, Some(from));
        assert_eq!(tx.input.input().map(|b| b.to_vec()), Some(vec![1, 2]));
    }
}
