use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    AlertEvent, AuditEntry, DistributionRecord, DistributionTotals, DistributionUpdate,
    NewDistribution,
};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("record {0} not found")]
    NotFound(i64),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

/// Donation/distribution records keyed by an auto-assigned id.
#[async_trait]
pub trait DistributionStore: Send + Sync {
    /// Newest record for the `(donor, usd)` pair created at or after `since`.
    async fn find_recent_distribution(
        &self,
        donor: &Address,
        usd_value: u64,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<DistributionRecord>>;
    async fn insert_distribution(&self, record: NewDistribution) -> StorageResult<i64>;
    async fn record_submission(&self, id: i64, tx_hash: &str, attempt: u32) -> StorageResult<()>;
    async fn finalize_distribution(&self, id: i64, update: DistributionUpdate)
        -> StorageResult<()>;
    async fn distribution_totals(&self) -> StorageResult<DistributionTotals>;
}

/// Append-only sink for audit entries and alerts.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> StorageResult<()>;
    async fn append_alert(&self, alert: AlertEvent) -> StorageResult<()>;
}

/// Key/value settings documents (contract addresses and similar).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn setting(&self, key: &str) -> StorageResult<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()>;
}
