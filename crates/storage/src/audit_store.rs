use chainops_domain::model::{AlertEvent, AuditEntry};
use chainops_domain::storage::{AuditSink, StorageError, StorageResult};
use sea_orm::{EntityTrait, Set};

use crate::entity::{alerts, audit_log};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl AuditSink for SeaOrmStorage {
    async fn append_audit(&self, entry: AuditEntry) -> StorageResult<()> {
        let model = audit_log::ActiveModel {
            kind: Set(entry.kind.to_string()),
            network: Set(entry.network.to_string()),
            subject: Set(entry.subject),
            payload: Set(entry.payload),
            created_at: Set(entry.recorded_at),
            ..Default::default()
        };
        audit_log::Entity::insert(model)
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }

    async fn append_alert(&self, alert: AlertEvent) -> StorageResult<()> {
        let model = alerts::ActiveModel {
            kind: Set(alert.kind.to_string()),
            severity: Set(alert.severity.to_string()),
            payload: Set(alert.payload),
            created_at: Set(alert.timestamp),
            ..Default::default()
        };
        alerts::Entity::insert(model)
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}
