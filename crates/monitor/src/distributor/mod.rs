//! Turns a validated donation into one `distributeTokens` transaction.
//!
//! Every gate before submission (supply, duplicates, authorization,
//! simulation) aborts without spending gas. After submission the only retry
//! is a single re-send with a fresh nonce and higher fees when the first
//! transaction was included but reverted.

mod fees;
mod signer;

use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::primitives::{keccak256, Address, Bytes, TxHash, U256};
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::json;
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use chainops_domain::{
    model::{
        address_key, tokens_for_usd, AttemptStatus, AuditEntry, AuditKind, DistributionRecord,
        DistributionStatus, DistributionUpdate, DonationRequest, GasParams, Network,
        NewDistribution, TransactionAttempt, ValidationError, DEFAULT_DUPLICATE_WINDOW,
        DEFAULT_TOKENS_PER_USD,
    },
    storage::{AuditSink, DistributionStore, StorageError},
};

use crate::{
    connection::{ConnectionMode, ProviderHandle, ProviderSource},
    contracts::{
        available_supply_call, classify_revert, decode_address, decode_bool, decode_uint,
        distribute_call, distributors_call, owner_call, RevertKind,
    },
    rpc::{with_timeout, CallRequest, ReceiptSummary, RpcError},
    status::{StatusHandle, StatusUpdate},
};

pub use fees::{escalate, initial_fees, FALLBACK_GAS_LIMIT};
pub use signer::{DistributionSigner, SignerError, UnsignedDistribution};

#[derive(Debug, Error, Clone, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DistributionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("distribution unavailable: {0}")]
    Unavailable(String),
    #[error("insufficient tokens for distribution: {available} available, {required} required")]
    InsufficientSupply { available: U256, required: U256 },
    #[error("signer {signer:#x} is neither an authorized distributor nor the contract owner")]
    Unauthorized { signer: Address },
    #[error("simulation reverted ({kind}): {reason}")]
    SimulationReverted { kind: RevertKind, reason: String },
    #[error("an identical distribution is still in flight")]
    DuplicateInFlight,
    #[error("transaction {tx_hash:#x} reverted after {attempts} attempts")]
    Reverted { tx_hash: TxHash, attempts: u32 },
    #[error("transaction {tx_hash:#x} not confirmed in time; check the explorer")]
    Unconfirmed { tx_hash: TxHash },
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Signing(#[from] SignerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DistributionError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &str {
        self.as_ref()
    }

    fn tx_hash(&self) -> Option<TxHash> {
        match self {
            DistributionError::Reverted { tx_hash, .. }
            | DistributionError::Unconfirmed { tx_hash } => Some(*tx_hash),
            _ => None,
        }
    }
}

impl From<RpcError> for DistributionError {
    fn from(err: RpcError) -> Self {
        DistributionError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReceipt {
    pub tx_hash: TxHash,
    /// Token base units (18 decimals).
    pub token_amount: U256,
    /// The hash belongs to an earlier identical request.
    pub replayed: bool,
    pub attempts: u32,
    pub confirmed: bool,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributorSettings {
    pub tokens_per_usd: u64,
    pub duplicate_window: Duration,
    /// Wait before re-checking an identical request that is still in flight.
    pub duplicate_pause: Duration,
    pub max_attempts: u32,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
    pub confirm_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for DistributorSettings {
    fn default() -> Self {
        Self {
            tokens_per_usd: DEFAULT_TOKENS_PER_USD,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            duplicate_pause: Duration::from_secs(3),
            max_attempts: 2,
            confirm_attempts: 30,
            confirm_interval: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(90),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

enum Admission {
    Replay(DistributionRecord),
    Admitted(i64),
}

enum Confirmation {
    Included(ReceiptSummary),
    Pending,
}

pub struct TokenDistributor {
    network: Network,
    contract: Address,
    signer: DistributionSigner,
    source: Arc<dyn ProviderSource>,
    store: Arc<dyn DistributionStore>,
    audit: Arc<dyn AuditSink>,
    status: StatusHandle,
    settings: DistributorSettings,
    admission: AsyncMutex<()>,
    nonce_lock: AsyncMutex<()>,
}

impl TokenDistributor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: Network,
        contract: Address,
        signer: DistributionSigner,
        source: Arc<dyn ProviderSource>,
        store: Arc<dyn DistributionStore>,
        audit: Arc<dyn AuditSink>,
        status: StatusHandle,
        settings: DistributorSettings,
    ) -> Self {
        Self {
            network,
            contract,
            signer,
            source,
            store,
            audit,
            status,
            settings,
            admission: AsyncMutex::new(()),
            nonce_lock: AsyncMutex::new(()),
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Distributes tokens for `usd_value` to `donor`. With `confirm` the call
    /// waits for a receipt and retries once on an included revert; without
    /// it the call returns right after broadcast.
    pub async fn distribute(
        &self,
        donor: &str,
        usd_value: f64,
        confirm: bool,
    ) -> Result<DistributionReceipt, DistributionError> {
        let started = Instant::now();
        let result = self.run(donor, usd_value, confirm).await;
        histogram!("distribution_latency_seconds").record(started.elapsed().as_secs_f64());

        let label = match &result {
            Ok(receipt) if receipt.replayed => "replayed".to_string(),
            Ok(_) => "ok".to_string(),
            Err(err) => err.kind().to_string(),
        };
        counter!("distribution_requests_total", "result" => label).increment(1);

        if let Err(err) = &result {
            warn!(network = %self.network, donor, usd_value, kind = err.kind(), error = %err, "distribution failed");
            if !matches!(err, DistributionError::Validation(_)) {
                self.status.error(format!("distribution to {donor} failed: {err}"));
            }
        }
        result
    }

    async fn run(
        &self,
        donor: &str,
        usd_value: f64,
        confirm: bool,
    ) -> Result<DistributionReceipt, DistributionError> {
        let request = DonationRequest::parse(donor, usd_value)?
            .with_window(self.settings.duplicate_window);
        let tokens = tokens_for_usd(request.usd_value, self.settings.tokens_per_usd);
        let donor_key = address_key(&request.donor_address);
        info!(
            network = %self.network,
            donor = %donor_key,
            usd_value = request.usd_value,
            tokens = %tokens,
            "distribution requested"
        );

        let handle = self.live_provider()?;
        self.check_supply(&handle, tokens).await?;

        let id = match self.admit(&request, tokens).await? {
            Admission::Replay(record) => return replay(record, tokens),
            Admission::Admitted(id) => id,
        };

        match self.execute(&request, tokens, id, confirm).await {
            Ok(receipt) => {
                self.store
                    .finalize_distribution(
                        id,
                        DistributionUpdate {
                            status: DistributionStatus::Distributed,
                            tx_hash: Some(format!("{:#x}", receipt.tx_hash)),
                            error: None,
                        },
                    )
                    .await?;
                self.status.apply(StatusUpdate::Distributed { tokens });
                info!(
                    donor = %donor_key,
                    tx_hash = %receipt.tx_hash,
                    attempts = receipt.attempts,
                    confirmed = receipt.confirmed,
                    "distribution complete"
                );
                Ok(receipt)
            }
            Err(err) => {
                // An unconfirmed transaction may still land; keep the row
                // pending so a repeat request replays its hash.
                let status = match err {
                    DistributionError::Unconfirmed { .. } => DistributionStatus::Pending,
                    _ => DistributionStatus::Failed,
                };
                self.store
                    .finalize_distribution(
                        id,
                        DistributionUpdate {
                            status,
                            tx_hash: err.tx_hash().map(|h| format!("{h:#x}")),
                            error: Some(err.to_string()),
                        },
                    )
                    .await?;
                self.record_audit(AuditEntry::new(
                    AuditKind::DistributionFailed,
                    self.network,
                    donor_key,
                    json!({
                        "usdValue": request.usd_value,
                        "tokenAmount": tokens.to_string(),
                        "kind": err.kind(),
                        "error": err.to_string(),
                    }),
                ))
                .await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &DonationRequest,
        tokens: U256,
        id: i64,
        confirm: bool,
    ) -> Result<DistributionReceipt, DistributionError> {
        let handle = self.live_provider()?;
        self.check_authorization(&handle).await?;

        let input = distribute_call(request.donor_address, request.usd_value);
        let call = CallRequest::new(self.contract, input.clone()).with_from(self.signer.address());
        self.simulate(&handle, &call).await?;

        let mut gas = self.price(&handle, &call).await?;
        let mut attempt_number = 1;
        loop {
            let mut attempt = self
                .submit(request, id, attempt_number, &input, gas)
                .await?;
            let tx_hash = attempt.tx_hash;
            self.record_audit(AuditEntry::new(
                AuditKind::DistributionSubmitted,
                self.network,
                address_key(&request.donor_address),
                attempt.audit_payload(tokens),
            ))
            .await;

            if !confirm {
                return Ok(DistributionReceipt {
                    tx_hash,
                    token_amount: tokens,
                    replayed: false,
                    attempts: attempt_number,
                    confirmed: false,
                    block_number: None,
                });
            }

            match self.await_receipt(tx_hash).await {
                Confirmation::Included(receipt) if receipt.success => {
                    attempt.status = AttemptStatus::Confirmed;
                    debug!(
                        tx_hash = %tx_hash,
                        status = attempt.status.as_ref(),
                        block = ?receipt.block_number,
                        "transaction included"
                    );
                    return Ok(DistributionReceipt {
                        tx_hash,
                        token_amount: tokens,
                        replayed: false,
                        attempts: attempt_number,
                        confirmed: true,
                        block_number: receipt.block_number,
                    });
                }
                Confirmation::Included(receipt) => {
                    attempt.status = AttemptStatus::Reverted;
                    warn!(
                        tx_hash = %tx_hash,
                        attempt = attempt_number,
                        nonce = attempt.nonce,
                        block = ?receipt.block_number,
                        "transaction included but reverted"
                    );
                    self.record_audit(AuditEntry::new(
                        AuditKind::DistributionFailed,
                        self.network,
                        address_key(&request.donor_address),
                        attempt.audit_payload(tokens),
                    ))
                    .await;
                    if attempt_number >= self.settings.max_attempts {
                        return Err(DistributionError::Reverted {
                            tx_hash,
                            attempts: attempt_number,
                        });
                    }
                    let handle = self.live_provider()?;
                    let fresh = self.price(&handle, &call).await.unwrap_or(gas);
                    gas = escalate(gas, fresh);
                    attempt_number += 1;
                    info!(
                        attempt = attempt_number,
                        max_fee_per_gas = gas.max_fee_per_gas,
                        max_priority_fee_per_gas = gas.max_priority_fee_per_gas,
                        "retrying with escalated fees"
                    );
                }
                Confirmation::Pending => {
                    return Err(DistributionError::Unconfirmed { tx_hash });
                }
            }
        }
    }

    fn live_provider(&self) -> Result<ProviderHandle, DistributionError> {
        match self.source.provider() {
            Some(handle) if handle.mode == ConnectionMode::Simulated => Err(
                DistributionError::Unavailable("simulated provider cannot submit transactions".into()),
            ),
            Some(handle) => Ok(handle),
            None => Err(DistributionError::Unavailable(
                "no live provider connected".into(),
            )),
        }
    }

    async fn read(&self, handle: &ProviderHandle, input: Bytes) -> Result<Bytes, RpcError> {
        let request = CallRequest::new(self.contract, input);
        with_timeout(self.settings.rpc_timeout, handle.client.call(&request)).await
    }

    async fn check_supply(
        &self,
        handle: &ProviderHandle,
        required: U256,
    ) -> Result<(), DistributionError> {
        let output = self.read(handle, available_supply_call()).await?;
        let available = decode_uint(&output).ok_or_else(|| {
            DistributionError::Network("malformed availableTokensForDistribution result".into())
        })?;
        debug!(available = %available, required = %required, "supply checked");
        if available < required {
            return Err(DistributionError::InsufficientSupply {
                available,
                required,
            });
        }
        Ok(())
    }

    /// Duplicate check and pending-row insert, serialized against other
    /// requests.
    async fn admit(
        &self,
        request: &DonationRequest,
        tokens: U256,
    ) -> Result<Admission, DistributionError> {
        let window = chrono::Duration::from_std(request.idempotency_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let mut paused = false;
        loop {
            let guard = self.admission.lock().await;
            let now = Utc::now();
            let prior = self
                .store
                .find_recent_distribution(&request.donor_address, request.usd_value, now - window)
                .await?;

            match prior {
                Some(record)
                    if record.status != DistributionStatus::Failed && record.tx_hash.is_some() =>
                {
                    info!(
                        donor = %record.donor_address,
                        tx_hash = ?record.tx_hash,
                        "identical distribution already submitted; replaying"
                    );
                    return Ok(Admission::Replay(record));
                }
                Some(record) if record.status == DistributionStatus::Pending => {
                    if paused {
                        return Err(DistributionError::DuplicateInFlight);
                    }
                    drop(guard);
                    debug!(record = record.id, "identical distribution in flight; pausing");
                    tokio::time::sleep(self.settings.duplicate_pause).await;
                    paused = true;
                }
                _ => {
                    let id = self
                        .store
                        .insert_distribution(NewDistribution {
                            donor_address: address_key(&request.donor_address),
                            usd_value: request.usd_value,
                            token_amount: tokens.to_string(),
                            created_at: now,
                        })
                        .await?;
                    return Ok(Admission::Admitted(id));
                }
            }
        }
    }

    async fn check_authorization(&self, handle: &ProviderHandle) -> Result<(), DistributionError> {
        let signer = self.signer.address();
        let output = self.read(handle, distributors_call(signer)).await?;
        if decode_bool(&output) == Some(true) {
            return Ok(());
        }
        let output = self.read(handle, owner_call()).await?;
        if decode_address(&output) == Some(signer) {
            return Ok(());
        }
        Err(DistributionError::Unauthorized { signer })
    }

    async fn simulate(
        &self,
        handle: &ProviderHandle,
        call: &CallRequest,
    ) -> Result<(), DistributionError> {
        match with_timeout(self.settings.rpc_timeout, handle.client.call(call)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_revert() => {
                let reason = match err {
                    RpcError::Rejected { message, .. } => message,
                    other => other.to_string(),
                };
                Err(DistributionError::SimulationReverted {
                    kind: classify_revert(&reason),
                    reason,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn price(
        &self,
        handle: &ProviderHandle,
        call: &CallRequest,
    ) -> Result<GasParams, DistributionError> {
        let timeout = self.settings.rpc_timeout;
        let suggestion = with_timeout(timeout, handle.client.fee_suggestion()).await?;
        let estimate = match with_timeout(timeout, handle.client.estimate_gas(call)).await {
            Ok(gas) => Some(gas),
            Err(err) => {
                warn!(error = %err, "gas estimation failed; using fallback limit");
                None
            }
        };
        Ok(initial_fees(self.network, suggestion, estimate))
    }

    /// Reads the nonce, signs and broadcasts under one lock so concurrent
    /// distributions never share a nonce. The hash is stored before the
    /// broadcast: a send whose acknowledgement is lost may still have reached
    /// the node, so it surfaces as `Unconfirmed` and the row stays replayable.
    async fn submit(
        &self,
        request: &DonationRequest,
        id: i64,
        attempt_number: u32,
        input: &Bytes,
        gas: GasParams,
    ) -> Result<TransactionAttempt, DistributionError> {
        let _nonce_guard = self.nonce_lock.lock().await;
        let handle = self.live_provider()?;
        let timeout = self.settings.rpc_timeout;
        let nonce =
            with_timeout(timeout, handle.client.transaction_count(self.signer.address())).await?;
        let raw = self
            .signer
            .sign(&UnsignedDistribution {
                chain_id: self.network.chain_id(),
                nonce,
                to: self.contract,
                input: input.clone(),
                gas,
            })
            .await?;
        let tx_hash = keccak256(&raw);
        self.store
            .record_submission(id, &format!("{tx_hash:#x}"), attempt_number)
            .await?;

        counter!("distribution_submissions_total").increment(1);
        match with_timeout(timeout, handle.client.send_raw_transaction(raw)).await {
            Ok(acknowledged) => {
                if acknowledged != tx_hash {
                    warn!(%acknowledged, expected = %tx_hash, "node acknowledged a different hash");
                }
            }
            Err(err @ (RpcError::Timeout(_) | RpcError::Transport(_))) => {
                warn!(
                    network = %self.network,
                    tx_hash = %tx_hash,
                    nonce,
                    error = %err,
                    "broadcast not acknowledged; transaction may still land"
                );
                return Err(DistributionError::Unconfirmed { tx_hash });
            }
            Err(err) => return Err(err.into()),
        }

        info!(
            network = %self.network,
            tx_hash = %tx_hash,
            nonce,
            max_fee_per_gas = gas.max_fee_per_gas,
            max_priority_fee_per_gas = gas.max_priority_fee_per_gas,
            gas_limit = gas.gas_limit,
            "distribution transaction broadcast"
        );
        Ok(TransactionAttempt {
            donation: request.clone(),
            nonce,
            gas,
            attempt_number,
            tx_hash,
            status: AttemptStatus::Pending,
        })
    }

    async fn await_receipt(&self, tx_hash: TxHash) -> Confirmation {
        let poll = async {
            for attempt in 0..self.settings.confirm_attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.settings.confirm_interval).await;
                }
                let Some(handle) = self.source.provider() else {
                    continue;
                };
                match with_timeout(
                    self.settings.rpc_timeout,
                    handle.client.transaction_receipt(tx_hash),
                )
                .await
                {
                    Ok(Some(receipt)) => return Confirmation::Included(receipt),
                    Ok(None) => debug!(tx_hash = %tx_hash, attempt, "receipt not available yet"),
                    Err(err) => warn!(tx_hash = %tx_hash, error = %err, "receipt poll failed"),
                }
            }
            Confirmation::Pending
        };
        tokio::time::timeout(self.settings.confirm_timeout, poll)
            .await
            .unwrap_or(Confirmation::Pending)
    }

    async fn record_audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.append_audit(entry).await {
            warn!(error = %err, "failed to write distribution audit entry");
        }
    }
}

fn replay(record: DistributionRecord, tokens: U256) -> Result<DistributionReceipt, DistributionError> {
    let raw = record.tx_hash.unwrap_or_default();
    let tx_hash = TxHash::from_str(&raw).map_err(|_| {
        DistributionError::Storage(StorageError::Database(format!(
            "record {} carries a malformed tx hash `{raw}`",
            record.id
        )))
    })?;
    Ok(DistributionReceipt {
        tx_hash,
        token_amount: tokens,
        replayed: true,
        attempts: record.attempts,
        confirmed: record.status == DistributionStatus::Distributed,
        block_number: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{FixedSource, MemoryStore, MockChain};
    use crate::status::StatusReporter;
    use alloy::primitives::address;
    use chainops_domain::{
        config::SigningKey,
        model::{Endpoint, Transport},
    };

    const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CONTRACT: Address = address!("1111111111111111111111111111111111111111");
    const DONOR: &str = "0x52908400098527886e0f7030069857d2e4169ee7";

    struct Fixture {
        chain: Arc<MockChain>,
        store: Arc<MemoryStore>,
        reporter: StatusReporter,
        distributor: TokenDistributor,
    }

    fn settings() -> DistributorSettings {
        DistributorSettings {
            duplicate_pause: Duration::from_millis(50),
            confirm_attempts: 3,
            confirm_interval: Duration::from_millis(10),
            confirm_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(1),
            ..DistributorSettings::default()
        }
    }

    fn fixture_with(source: Option<ConnectionMode>) -> Fixture {
        let chain = MockChain::new(Network::Polygon);
        let signer = DistributionSigner::from_key(&SigningKey::new(ANVIL_KEY)).unwrap();
        chain.authorize(signer.address());
        let store = MemoryStore::new();
        let reporter = StatusReporter::new();
        let source: Arc<dyn ProviderSource> = match source {
            Some(mode) => FixedSource::new(
                chain.client(Endpoint::new(Network::Polygon, Transport::Http, "https://mock", 0)),
                mode,
            ),
            None => FixedSource::empty(),
        };
        let distributor = TokenDistributor::new(
            Network::Polygon,
            CONTRACT,
            signer,
            source,
            store.clone(),
            store.clone(),
            reporter.handle(),
            settings(),
        );
        Fixture {
            chain,
            store,
            reporter,
            distributor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Some(ConnectionMode::Http))
    }

    fn tokens(usd: u64) -> U256 {
        tokens_for_usd(usd, DEFAULT_TOKENS_PER_USD)
    }

    #[tokio::test]
    async fn distributes_and_records_success() {
        let fx = fixture();
        let receipt = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();

        assert_eq!(receipt.token_amount, tokens(5));
        assert!(receipt.confirmed);
        assert!(!receipt.replayed);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(fx.chain.send_count(), 1);

        let rows = fx.store.distributions();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DistributionStatus::Distributed);
        assert_eq!(rows[0].tx_hash, Some(format!("{:#x}", receipt.tx_hash)));
        assert_eq!(rows[0].token_amount, tokens(5).to_string());

        let sent = fx.chain.sent_transactions();
        assert_eq!(sent[0].max_priority_fee_per_gas, 39_000_000_000);
        assert_eq!(sent[0].max_fee_per_gas, 80_000_000_000);
        assert_eq!(sent[0].gas_limit, 120_000);

        let snapshot = fx.reporter.snapshot();
        assert!(snapshot.token_distribution_active);
        assert_eq!(snapshot.distribution_count, 1);
        assert_eq!(fx.store.audit_entries()[0].kind, AuditKind::DistributionSubmitted);
    }

    #[tokio::test]
    async fn rejects_sub_dollar_values_without_network_calls() {
        let fx = fixture();
        let err = fx.distributor.distribute(DONOR, 0.6, true).await.unwrap_err();
        assert!(matches!(
            err,
            DistributionError::Validation(ValidationError::BelowMinimum(_))
        ));
        assert_eq!(err.kind(), "validation");
        assert_eq!(fx.chain.call_count(), 0);
        assert!(fx.store.distributions().is_empty());
        assert!(fx.reporter.snapshot().errors.is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_addresses() {
        let fx = fixture();
        let err = fx.distributor.distribute("0xABC", 5.0, true).await.unwrap_err();
        assert!(matches!(
            err,
            DistributionError::Validation(ValidationError::InvalidAddress(_))
        ));
        assert_eq!(fx.chain.call_count(), 0);
    }

    #[tokio::test]
    async fn refuses_without_a_real_provider() {
        let none = fixture_with(None);
        assert!(matches!(
            none.distributor.distribute(DONOR, 5.0, true).await,
            Err(DistributionError::Unavailable(_))
        ));

        let simulated = fixture_with(Some(ConnectionMode::Simulated));
        assert!(matches!(
            simulated.distributor.distribute(DONOR, 5.0, true).await,
            Err(DistributionError::Unavailable(_))
        ));
        assert_eq!(simulated.chain.send_count(), 0);
    }

    #[tokio::test]
    async fn insufficient_supply_stops_before_any_record() {
        let fx = fixture();
        fx.chain.set_available_supply(tokens(4));
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        assert_eq!(
            err,
            DistributionError::InsufficientSupply {
                available: tokens(4),
                required: tokens(5)
            }
        );
        assert!(fx.store.distributions().is_empty());
        assert_eq!(fx.chain.send_count(), 0);
    }

    #[tokio::test]
    async fn unauthorized_signer_is_rejected() {
        let fx = fixture();
        let other = MockChain::new(Network::Polygon);
        let signer = DistributionSigner::from_key(&SigningKey::new(
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        ))
        .unwrap();
        let distributor = TokenDistributor::new(
            Network::Polygon,
            CONTRACT,
            signer,
            FixedSource::new(
                other.client(Endpoint::new(Network::Polygon, Transport::Http, "https://other", 0)),
                ConnectionMode::Http,
            ),
            fx.store.clone(),
            fx.store.clone(),
            fx.reporter.handle(),
            settings(),
        );

        let err = distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        assert!(matches!(err, DistributionError::Unauthorized { .. }));
        assert_eq!(other.send_count(), 0);
        assert_eq!(fx.store.distributions()[0].status, DistributionStatus::Failed);
        assert_eq!(fx.reporter.snapshot().errors.len(), 1);
    }

    #[tokio::test]
    async fn owner_may_distribute() {
        let fx = fixture();
        let chain = MockChain::new(Network::Polygon);
        let signer = DistributionSigner::from_key(&SigningKey::new(ANVIL_KEY)).unwrap();
        chain.set_owner(signer.address());
        let distributor = TokenDistributor::new(
            Network::Polygon,
            CONTRACT,
            signer,
            FixedSource::new(
                chain.client(Endpoint::new(Network::Polygon, Transport::Ws, "wss://owner", 0)),
                ConnectionMode::Ws,
            ),
            fx.store.clone(),
            fx.store.clone(),
            fx.reporter.handle(),
            settings(),
        );
        distributor.distribute(DONOR, 2.0, true).await.unwrap();
        assert_eq!(chain.send_count(), 1);
    }

    #[tokio::test]
    async fn simulation_revert_spends_no_gas() {
        let fx = fixture();
        fx.chain
            .set_simulation_revert(Some("Insufficient tokens available"));
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        assert!(matches!(
            err,
            DistributionError::SimulationReverted {
                kind: RevertKind::InsufficientTokens,
                ..
            }
        ));
        assert_eq!(fx.chain.send_count(), 0);
        let audit = fx.store.audit_entries();
        assert_eq!(audit.last().unwrap().kind, AuditKind::DistributionFailed);
        assert_eq!(audit.last().unwrap().payload["kind"], "simulation_reverted");
    }

    #[tokio::test]
    async fn identical_request_replays_earlier_hash() {
        let fx = fixture();
        let first = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();
        let second = fx.distributor.distribute(DONOR, 5.9, true).await.unwrap();

        assert!(second.replayed);
        assert_eq!(second.tx_hash, first.tx_hash);
        assert_eq!(fx.chain.send_count(), 1);
        assert_eq!(fx.store.distributions().len(), 1);

        fx.distributor.distribute(DONOR, 6.0, true).await.unwrap();
        assert_eq!(fx.chain.send_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_submit_once() {
        let fx = fixture();
        let (a, b) = tokio::join!(
            fx.distributor.distribute(DONOR, 5.0, true),
            fx.distributor.distribute(DONOR, 5.0, true)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.tx_hash, b.tx_hash);
        assert!(a.replayed ^ b.replayed);
        assert_eq!(fx.chain.send_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_distributions_use_distinct_nonces() {
        let fx = fixture();
        fx.chain.set_nonce(9);
        let (a, b) = tokio::join!(
            fx.distributor.distribute(DONOR, 5.0, false),
            fx.distributor.distribute(DONOR, 7.0, false)
        );
        a.unwrap();
        b.unwrap();
        let mut nonces: Vec<u64> = fx
            .chain
            .sent_transactions()
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort_unstable();
        assert_eq!(nonces, vec![9, 10]);
    }

    #[tokio::test]
    async fn included_revert_retries_once_with_higher_fees() {
        let fx = fixture();
        fx.chain.plan_receipts(&[false]);
        let receipt = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();
        assert_eq!(receipt.attempts, 2);

        let sent = fx.chain.sent_transactions();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].nonce, sent[1].nonce);
        assert!(sent[1].max_fee_per_gas > sent[0].max_fee_per_gas);
        assert!(sent[1].max_priority_fee_per_gas > sent[0].max_priority_fee_per_gas);
        assert_eq!(fx.store.distributions()[0].attempts, 2);
    }

    #[tokio::test]
    async fn second_revert_is_terminal() {
        let fx = fixture();
        fx.chain.plan_receipts(&[false, false, false]);
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        assert!(matches!(err, DistributionError::Reverted { attempts: 2, .. }));
        assert_eq!(fx.chain.send_count(), 2);

        let row = &fx.store.distributions()[0];
        assert_eq!(row.status, DistributionStatus::Failed);
        assert!(row.tx_hash.is_some());
    }

    #[tokio::test]
    async fn missing_receipt_reports_unconfirmed() {
        let fx = fixture();
        fx.chain.withhold_receipts(true);
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        let DistributionError::Unconfirmed { tx_hash } = err else {
            panic!("expected unconfirmed, got {err:?}");
        };
        assert_eq!(fx.chain.send_count(), 1);

        let row = &fx.store.distributions()[0];
        assert_eq!(row.status, DistributionStatus::Pending);
        assert_eq!(row.tx_hash, Some(format!("{tx_hash:#x}")));

        let replay = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();
        assert!(replay.replayed);
        assert!(!replay.confirmed);
        assert_eq!(fx.chain.send_count(), 1);
    }

    #[tokio::test]
    async fn lost_broadcast_ack_keeps_hash_for_replay() {
        let fx = fixture();
        fx.chain.plan_lost_acks(&[true]);
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        let DistributionError::Unconfirmed { tx_hash } = err else {
            panic!("expected unconfirmed, got {err:?}");
        };
        assert_eq!(fx.chain.send_count(), 1);

        let row = &fx.store.distributions()[0];
        assert_eq!(row.status, DistributionStatus::Pending);
        assert_eq!(row.tx_hash, Some(format!("{tx_hash:#x}")));
        assert_eq!(row.attempts, 1);

        let retry = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.tx_hash, tx_hash);
        assert_eq!(fx.chain.send_count(), 1);
        assert_eq!(fx.store.distributions().len(), 1);
    }

    #[tokio::test]
    async fn lost_ack_on_escalated_retry_keeps_second_hash() {
        let fx = fixture();
        fx.chain.plan_receipts(&[false]);
        fx.chain.plan_lost_acks(&[false, true]);
        let err = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap_err();
        let DistributionError::Unconfirmed { tx_hash } = err else {
            panic!("expected unconfirmed, got {err:?}");
        };
        assert_eq!(fx.chain.send_count(), 2);

        let row = &fx.store.distributions()[0];
        assert_eq!(row.status, DistributionStatus::Pending);
        assert_eq!(row.attempts, 2);
        assert_eq!(row.tx_hash, Some(format!("{tx_hash:#x}")));

        let submitted: Vec<_> = fx
            .store
            .audit_entries()
            .into_iter()
            .filter(|entry| entry.kind == AuditKind::DistributionSubmitted)
            .collect();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].payload["status"], "pending");
        assert_ne!(submitted[0].payload["txHash"], format!("{tx_hash:#x}"));

        let retry = fx.distributor.distribute(DONOR, 5.0, true).await.unwrap();
        assert!(retry.replayed);
        assert_eq!(retry.tx_hash, tx_hash);
        assert_eq!(fx.chain.send_count(), 2);
    }

    #[tokio::test]
    async fn fire_and_forget_skips_confirmation() {
        let fx = fixture();
        fx.chain.withhold_receipts(true);
        let receipt = fx.distributor.distribute(DONOR, 3.0, false).await.unwrap();
        assert!(!receipt.confirmed);
        assert_eq!(
            fx.store.distributions()[0].status,
            DistributionStatus::Distributed
        );
    }
}
