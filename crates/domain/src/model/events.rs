use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

use super::network::Network;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MonitorKind {
    Learn2earn,
    Wallet,
    TokenDistribution,
}

/// Something on-chain the monitor watches for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub contract_address: Address,
    pub network: Network,
    pub event_signatures: Vec<B256>,
    pub kind: MonitorKind,
}

impl MonitorTarget {
    pub fn label(&self) -> String {
        format!("{}:{:#x}", self.kind, self.contract_address)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    LargeDistribution,
    LargeClaim,
    LowBalance,
    HighGasSpend,
    ProviderFallback,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Threshold-triggered alert forwarded to the audit sink. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, severity: Severity, payload: Value) -> Self {
        Self {
            kind,
            severity,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditKind {
    TokensDistributed,
    Learn2earnClaimed,
    WalletActivity,
    DistributionSubmitted,
    DistributionFailed,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub kind: AuditKind,
    pub network: Network,
    pub subject: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(kind: AuditKind, network: Network, subject: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            network,
            subject: subject.into(),
            payload,
            recorded_at: Utc::now(),
        }
    }
}
