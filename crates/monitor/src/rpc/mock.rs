//! In-process chain, connector and record store used by unit and scenario
//! tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy::{
    consensus::{Transaction as _, TxEnvelope},
    eips::eip2718::Decodable2718,
    primitives::{keccak256, Address, Bytes, TxHash, U256},
    sol_types::SolCall,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::broadcast;

use chainops_domain::{
    model::{
        address_key, AlertEvent, AuditEntry, DistributionRecord, DistributionStatus,
        DistributionTotals, DistributionUpdate, Endpoint, Network, NewDistribution,
    },
    storage::{AuditSink, DistributionStore, SettingsStore, StorageError, StorageResult},
};

use super::{
    CallRequest, ChainClient, ChainLog, EndpointConnector, FeeSuggestion, LogFilter, LogStream,
    ReceiptSummary, RpcError,
};
use crate::connection::{ConnectionMode, ProviderHandle, ProviderSource};
use crate::contracts::{decode_address, ITokenDistributor};

const GWEI: u128 = 1_000_000_000;

struct MockState {
    offline: bool,
    block_number: u64,
    balance: U256,
    nonce: u64,
    available_supply: U256,
    owner: Address,
    distributors: HashSet<Address>,
    simulation_revert: Option<String>,
    receipt_plan: VecDeque<bool>,
    withhold_receipts: bool,
    lost_acks: VecDeque<bool>,
    code: Bytes,
    fees: FeeSuggestion,
    receipts: HashMap<TxHash, ReceiptSummary>,
    sent: Vec<Bytes>,
}

/// Scriptable chain shared by every client connected to it.
pub(crate) struct MockChain {
    network: Network,
    state: Mutex<MockState>,
    logs: broadcast::Sender<ChainLog>,
    calls: AtomicUsize,
    sends: AtomicUsize,
}

/// Fields of a transaction the mock chain accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentTransaction {
    pub nonce: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_limit: u64,
}

fn word(value: U256) -> Bytes {
    Bytes::from(value.to_be_bytes::<32>().to_vec())
}

impl MockChain {
    pub fn new(network: Network) -> Arc<Self> {
        let (logs, _) = broadcast::channel(64);
        Arc::new(Self {
            network,
            state: Mutex::new(MockState {
                offline: false,
                block_number: 1,
                balance: U256::from(10u64).pow(U256::from(18u64)),
                nonce: 0,
                available_supply: U256::MAX,
                owner: Address::ZERO,
                distributors: HashSet::new(),
                simulation_revert: None,
                receipt_plan: VecDeque::new(),
                withhold_receipts: false,
                lost_acks: VecDeque::new(),
                code: Bytes::from(vec![0x60, 0x80]),
                fees: FeeSuggestion {
                    gas_price: 40 * GWEI,
                    max_priority_fee: 2 * GWEI,
                },
                receipts: HashMap::new(),
                sent: Vec::new(),
            }),
            logs,
            calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        })
    }

    pub fn client(self: &Arc<Self>, endpoint: Endpoint) -> Arc<dyn ChainClient> {
        Arc::new(MockClient {
            endpoint,
            chain: self.clone(),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    pub fn set_block_number(&self, block: u64) {
        self.with_state(|s| s.block_number = block);
    }

    pub fn set_balance(&self, balance: U256) {
        self.with_state(|s| s.balance = balance);
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.with_state(|s| s.nonce = nonce);
    }

    pub fn set_available_supply(&self, supply: U256) {
        self.with_state(|s| s.available_supply = supply);
    }

    pub fn set_owner(&self, owner: Address) {
        self.with_state(|s| s.owner = owner);
    }

    pub fn authorize(&self, distributor: Address) {
        self.with_state(|s| {
            s.distributors.insert(distributor);
        });
    }

    pub fn set_simulation_revert(&self, reason: Option<&str>) {
        self.with_state(|s| s.simulation_revert = reason.map(str::to_string));
    }

    pub fn set_code(&self, code: Bytes) {
        self.with_state(|s| s.code = code);
    }

    /// Receipt statuses handed out to the next sends, in order. Sends beyond
    /// the plan succeed.
    pub fn plan_receipts(&self, statuses: &[bool]) {
        self.with_state(|s| s.receipt_plan = statuses.iter().copied().collect());
    }

    /// Each `true` accepts the next broadcast but reports a timeout instead
    /// of the hash.
    pub fn plan_lost_acks(&self, lost: &[bool]) {
        self.with_state(|s| s.lost_acks = lost.iter().copied().collect());
    }

    pub fn withhold_receipts(&self, withhold: bool) {
        self.with_state(|s| s.withhold_receipts = withhold);
    }

    pub fn emit(&self, log: ChainLog) {
        let _ = self.logs.send(log);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.with_state(|s| {
            s.sent
                .iter()
                .map(|raw| {
                    let mut slice: &[u8] = raw.as_ref();
                    let envelope = TxEnvelope::decode_2718(&mut slice).expect("signed envelope");
                    SentTransaction {
                        nonce: envelope.nonce(),
                        max_fee_per_gas: envelope.max_fee_per_gas(),
                        max_priority_fee_per_gas: envelope
                            .max_priority_fee_per_gas()
                            .unwrap_or_default(),
                        gas_limit: envelope.gas_limit(),
                    }
                })
                .collect()
        })
    }

    fn touch(&self) -> Result<(), RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.with_state(|s| s.offline) {
            return Err(RpcError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

struct MockClient {
    endpoint: Endpoint,
    chain: Arc<MockChain>,
}

#[async_trait]
impl ChainClient for MockClient {
    fn describe(&self) -> String {
        self.endpoint.url.clone()
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.block_number))
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.network.chain_id())
    }

    async fn balance(&self, _address: Address) -> Result<U256, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.balance))
    }

    async fn code_at(&self, _address: Address) -> Result<Bytes, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.code.clone()))
    }

    async fn transaction_count(&self, _address: Address) -> Result<u64, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.nonce))
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.chain.touch()?;
        let input = request.input.as_ref();
        let selector: [u8; 4] = input
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| RpcError::Rejected {
                code: -32602,
                message: "missing selector".to_string(),
            })?;
        self.chain.with_state(|s| {
            if selector == ITokenDistributor::availableTokensForDistributionCall::SELECTOR {
                Ok(word(s.available_supply))
            } else if selector == ITokenDistributor::distributorsCall::SELECTOR {
                let account = decode_address(&input[4..]).unwrap_or_default();
                Ok(word(U256::from(s.distributors.contains(&account) as u8)))
            } else if selector == ITokenDistributor::ownerCall::SELECTOR {
                Ok(Bytes::from(s.owner.into_word().0.to_vec()))
            } else if selector == ITokenDistributor::distributeTokensCall::SELECTOR {
                match &s.simulation_revert {
                    Some(reason) => Err(RpcError::Rejected {
                        code: 3,
                        message: format!("execution reverted: {reason}"),
                    }),
                    None => Ok(Bytes::new()),
                }
            } else {
                Err(RpcError::Rejected {
                    code: 3,
                    message: "execution reverted".to_string(),
                })
            }
        })
    }

    async fn estimate_gas(&self, _request: &CallRequest) -> Result<u64, RpcError> {
        self.chain.touch()?;
        Ok(100_000)
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.fees))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, RpcError> {
        self.chain.touch()?;
        self.chain.sends.fetch_add(1, Ordering::SeqCst);
        let hash = keccak256(&raw);
        let lost = self.chain.with_state(|s| {
            s.nonce += 1;
            s.block_number += 1;
            let success = s.receipt_plan.pop_front().unwrap_or(true);
            if !s.withhold_receipts {
                s.receipts.insert(
                    hash,
                    ReceiptSummary {
                        tx_hash: hash,
                        success,
                        block_number: Some(s.block_number),
                        gas_used: 60_000,
                        effective_gas_price: s.fees.gas_price,
                    },
                );
            }
            s.sent.push(raw);
            s.lost_acks.pop_front().unwrap_or(false)
        });
        if lost {
            return Err(RpcError::Timeout(Duration::from_secs(10)));
        }
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<ReceiptSummary>, RpcError> {
        self.chain.touch()?;
        Ok(self.chain.with_state(|s| s.receipts.get(&hash).cloned()))
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogStream, RpcError> {
        self.chain.touch()?;
        let receiver = self.chain.logs.subscribe();
        let filter = filter.clone();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(log) => return Some((log, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |log| {
            let matches = log.address == filter.address
                && log
                    .topics
                    .first()
                    .is_some_and(|topic| filter.topics.contains(topic));
            futures::future::ready(matches)
        });
        Ok(stream.boxed())
    }
}

/// Routes endpoint URLs to mock chains. Unrouted URLs refuse to connect.
#[derive(Default)]
pub(crate) struct MockConnector {
    routes: Mutex<HashMap<String, Arc<MockChain>>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, chain: Arc<MockChain>) {
        self.routes.lock().unwrap().insert(url.to_string(), chain);
    }

    pub fn connects(&self, url: &str) -> usize {
        self.connects.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EndpointConnector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn ChainClient>, RpcError> {
        *self
            .connects
            .lock()
            .unwrap()
            .entry(endpoint.url.clone())
            .or_default() += 1;
        let chain = self.routes.lock().unwrap().get(&endpoint.url).cloned();
        match chain {
            Some(chain) => Ok(chain.client(endpoint.clone())),
            None => Err(RpcError::Transport(format!(
                "connection refused: {}",
                endpoint.url
            ))),
        }
    }
}

/// Provider source pinned to one handle, recording disconnect reports.
pub(crate) struct FixedSource {
    handle: Mutex<Option<ProviderHandle>>,
    disconnects: Mutex<Vec<(u64, String)>>,
}

impl FixedSource {
    pub fn new(client: Arc<dyn ChainClient>, mode: ConnectionMode) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(Some(ProviderHandle {
                generation: 1,
                mode,
                client,
            })),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(None),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn disconnects(&self) -> Vec<(u64, String)> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl ProviderSource for FixedSource {
    fn provider(&self) -> Option<ProviderHandle> {
        self.handle.lock().unwrap().clone()
    }

    fn report_disconnect(&self, generation: u64, reason: &str) {
        self.disconnects
            .lock()
            .unwrap()
            .push((generation, reason.to_string()));
    }
}

/// Record store kept in memory.
#[derive(Default)]
pub(crate) struct MemoryStore {
    distributions: Mutex<Vec<DistributionRecord>>,
    audit: Mutex<Vec<AuditEntry>>,
    alerts: Mutex<Vec<AlertEvent>>,
    settings: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn distributions(&self) -> Vec<DistributionRecord> {
        self.distributions.lock().unwrap().clone()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DistributionStore for MemoryStore {
    async fn find_recent_distribution(
        &self,
        donor: &Address,
        usd_value: u64,
        since: chrono::DateTime<Utc>,
    ) -> StorageResult<Option<DistributionRecord>> {
        let key = address_key(donor);
        Ok(self
            .distributions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.donor_address == key && r.usd_value == usd_value && r.created_at >= since)
            .cloned())
    }

    async fn insert_distribution(&self, record: NewDistribution) -> StorageResult<i64> {
        let mut rows = self.distributions.lock().unwrap();
        let id = rows.len() as i64 + 1;
        rows.push(DistributionRecord {
            id,
            donor_address: record.donor_address,
            usd_value: record.usd_value,
            token_amount: record.token_amount,
            status: DistributionStatus::Pending,
            tx_hash: None,
            error: None,
            attempts: 0,
            created_at: record.created_at,
            updated_at: record.created_at,
        });
        Ok(id)
    }

    async fn record_submission(&self, id: i64, tx_hash: &str, attempt: u32) -> StorageResult<()> {
        let mut rows = self.distributions.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StorageError::NotFound(id))?;
        row.tx_hash = Some(tx_hash.to_string());
        row.attempts = attempt;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_distribution(
        &self,
        id: i64,
        update: DistributionUpdate,
    ) -> StorageResult<()> {
        let mut rows = self.distributions.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StorageError::NotFound(id))?;
        row.status = update.status;
        if update.tx_hash.is_some() {
            row.tx_hash = update.tx_hash;
        }
        row.error = update.error;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn distribution_totals(&self) -> StorageResult<DistributionTotals> {
        let rows = self.distributions.lock().unwrap();
        let mut totals = DistributionTotals::default();
        for row in rows
            .iter()
            .filter(|r| r.status == DistributionStatus::Distributed)
        {
            totals.count += 1;
            totals.tokens += row.token_amount.parse::<U256>().unwrap_or_default();
        }
        Ok(totals)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append_audit(&self, entry: AuditEntry) -> StorageResult<()> {
        self.audit.lock().unwrap().push(entry);
        Ok(())
    }

    async fn append_alert(&self, alert: AlertEvent) -> StorageResult<()> {
        self.alerts.lock().unwrap().push(alert);
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.settings.lock().unwrap().get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.settings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
