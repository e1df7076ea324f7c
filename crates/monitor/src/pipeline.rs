use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use alloy::primitives::{Address, TxHash, U256};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{info, warn};

use chainops_domain::{
    config::AlertThresholds,
    model::{address_key, AlertEvent, AlertKind, AuditEntry, AuditKind, Network, Severity},
    storage::{AuditSink, StorageResult},
};

use crate::{
    contracts::{decode_event, ContractEvent},
    rpc::ChainLog,
    status::{StatusHandle, StatusUpdate},
};

const TOKEN_UNIT: u64 = 1_000_000_000_000_000_000;

/// Something the monitor observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Contract {
        contract: Address,
        tx_hash: Option<TxHash>,
        block_number: Option<u64>,
        event: ContractEvent,
    },
    /// The watched wallet's nonce moved between two polls.
    WalletActivity {
        wallet: Address,
        previous_nonce: u64,
        nonce: u64,
        previous_balance: U256,
        balance: U256,
    },
}

impl ChainEvent {
    pub fn from_log(log: &ChainLog) -> Option<Self> {
        Some(ChainEvent::Contract {
            contract: log.address,
            tx_hash: log.tx_hash,
            block_number: log.block_number,
            event: decode_event(log)?,
        })
    }

    fn audit(&self, network: Network) -> AuditEntry {
        match self {
            ChainEvent::Contract {
                contract,
                tx_hash,
                block_number,
                event,
            } => {
                let location = json!({
                    "contract": address_key(contract),
                    "txHash": tx_hash.map(|h| format!("{h:#x}")),
                    "blockNumber": block_number,
                });
                match event {
                    ContractEvent::TokensDistributed {
                        donor,
                        token_amount,
                        usd_value,
                    } => AuditEntry::new(
                        AuditKind::TokensDistributed,
                        network,
                        address_key(donor),
                        merge(
                            location,
                            json!({
                                "tokenAmount": token_amount.to_string(),
                                "usdValue": usd_value.to_string(),
                            }),
                        ),
                    ),
                    ContractEvent::Learn2EarnClaimed {
                        learn2earn_id,
                        user,
                        amount,
                    } => AuditEntry::new(
                        AuditKind::Learn2earnClaimed,
                        network,
                        address_key(user),
                        merge(
                            location,
                            json!({
                                "learn2earnId": learn2earn_id.to_string(),
                                "amount": amount.to_string(),
                            }),
                        ),
                    ),
                }
            }
            ChainEvent::WalletActivity {
                wallet,
                previous_nonce,
                nonce,
                previous_balance,
                balance,
            } => AuditEntry::new(
                AuditKind::WalletActivity,
                network,
                address_key(wallet),
                json!({
                    "previousNonce": previous_nonce,
                    "nonce": nonce,
                    "outboundTransactions": nonce.saturating_sub(*previous_nonce),
                    "previousBalance": previous_balance.to_string(),
                    "balance": balance.to_string(),
                    "spent": previous_balance.saturating_sub(*balance).to_string(),
                }),
            ),
        }
    }

    fn kind(&self) -> AuditKind {
        match self {
            ChainEvent::Contract {
                event: ContractEvent::TokensDistributed { .. },
                ..
            } => AuditKind::TokensDistributed,
            ChainEvent::Contract {
                event: ContractEvent::Learn2EarnClaimed { .. },
                ..
            } => AuditKind::Learn2earnClaimed,
            ChainEvent::WalletActivity { .. } => AuditKind::WalletActivity,
        }
    }
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(base), Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

fn whole_tokens(tokens: u64) -> U256 {
    U256::from(tokens).saturating_mul(U256::from(TOKEN_UNIT))
}

/// Audits every observed event and raises threshold alerts.
pub struct EventPipeline {
    sink: Arc<dyn AuditSink>,
    network: Network,
    thresholds: AlertThresholds,
    status: StatusHandle,
    below_low_balance: AtomicBool,
}

impl EventPipeline {
    pub fn new(
        sink: Arc<dyn AuditSink>,
        network: Network,
        thresholds: AlertThresholds,
        status: StatusHandle,
    ) -> Self {
        Self {
            sink,
            network,
            thresholds,
            status,
            below_low_balance: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Writes the audit entry, then any alerts the event crosses. Returns the
    /// number of alerts raised.
    pub async fn process_event(&self, event: &ChainEvent) -> StorageResult<usize> {
        let kind = self.kind_label(event);
        counter!("monitor_events_total", "kind" => kind).increment(1);
        self.sink.append_audit(event.audit(self.network)).await?;

        let mut raised = 0;
        for alert in self.alerts_for(event) {
            self.raise(alert).await?;
            raised += 1;
        }
        Ok(raised)
    }

    /// Records the latest wallet balance and raises `low_balance` once each
    /// time it drops under the threshold.
    pub async fn observe_wallet_balance(
        &self,
        wallet: Address,
        balance: U256,
    ) -> StorageResult<bool> {
        self.status.apply(StatusUpdate::WalletBalance(balance));
        let threshold = U256::from(self.thresholds.low_balance_wei);
        if balance >= threshold {
            self.below_low_balance.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        if self.below_low_balance.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        warn!(
            network = %self.network,
            wallet = %address_key(&wallet),
            balance = %balance,
            "service wallet balance under threshold"
        );
        self.raise(AlertEvent::new(
            AlertKind::LowBalance,
            Severity::Critical,
            json!({
                "network": self.network,
                "wallet": address_key(&wallet),
                "balance": balance.to_string(),
                "threshold": threshold.to_string(),
            }),
        ))
        .await?;
        Ok(true)
    }

    pub async fn raise(&self, alert: AlertEvent) -> StorageResult<()> {
        counter!("monitor_alerts_total", "kind" => alert.kind.as_ref().to_string()).increment(1);
        info!(kind = %alert.kind, severity = %alert.severity, "alert raised");
        self.sink.append_alert(alert).await
    }

    fn kind_label(&self, event: &ChainEvent) -> String {
        event.kind().as_ref().to_string()
    }

    fn alerts_for(&self, event: &ChainEvent) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();
        match event {
            ChainEvent::Contract {
                event:
                    ContractEvent::TokensDistributed {
                        donor,
                        token_amount,
                        ..
                    },
                tx_hash,
                ..
            } => {
                let limit = whole_tokens(self.thresholds.large_distribution_tokens);
                if *token_amount > limit {
                    alerts.push(AlertEvent::new(
                        AlertKind::LargeDistribution,
                        Severity::Warning,
                        json!({
                            "network": self.network,
                            "donor": address_key(donor),
                            "tokenAmount": token_amount.to_string(),
                            "threshold": limit.to_string(),
                            "txHash": tx_hash.map(|h| format!("{h:#x}")),
                        }),
                    ));
                }
            }
            ChainEvent::Contract {
                event: ContractEvent::Learn2EarnClaimed { user, amount, .. },
                tx_hash,
                ..
            } => {
                let limit = whole_tokens(self.thresholds.large_claim_tokens);
                if *amount > limit {
                    alerts.push(AlertEvent::new(
                        AlertKind::LargeClaim,
                        Severity::Warning,
                        json!({
                            "network": self.network,
                            "user": address_key(user),
                            "amount": amount.to_string(),
                            "threshold": limit.to_string(),
                            "txHash": tx_hash.map(|h| format!("{h:#x}")),
                        }),
                    ));
                }
            }
            ChainEvent::WalletActivity {
                wallet,
                previous_balance,
                balance,
                ..
            } => {
                let spent = previous_balance.saturating_sub(*balance);
                let limit = U256::from(self.thresholds.high_gas_wei);
                if spent > limit {
                    alerts.push(AlertEvent::new(
                        AlertKind::HighGasSpend,
                        Severity::Warning,
                        json!({
                            "network": self.network,
                            "wallet": address_key(wallet),
                            "spent": spent.to_string(),
                            "threshold": limit.to_string(),
                        }),
                    ));
                }
            }
        }
        alerts
    }
}
