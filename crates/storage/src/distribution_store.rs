use alloy_primitives::{Address, U256};
use chainops_domain::model::{
    address_key, DistributionRecord, DistributionStatus, DistributionTotals, DistributionUpdate,
    NewDistribution,
};
use chainops_domain::storage::{DistributionStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::entity::distributions::{self, DistributionStatusDb};
use crate::SeaOrmStorage;

impl From<DistributionStatus> for DistributionStatusDb {
    fn from(status: DistributionStatus) -> Self {
        match status {
            DistributionStatus::Pending => Self::Pending,
            DistributionStatus::Distributed => Self::Distributed,
            DistributionStatus::Failed => Self::Failed,
        }
    }
}

impl From<DistributionStatusDb> for DistributionStatus {
    fn from(status: DistributionStatusDb) -> Self {
        match status {
            DistributionStatusDb::Pending => Self::Pending,
            DistributionStatusDb::Distributed => Self::Distributed,
            DistributionStatusDb::Failed => Self::Failed,
        }
    }
}

fn to_record(model: distributions::Model) -> StorageResult<DistributionRecord> {
    Ok(DistributionRecord {
        id: model.id,
        donor_address: model.donor_address,
        usd_value: u64::try_from(model.usd_value).map_err(StorageError::from_source)?,
        token_amount: model.token_amount,
        status: model.status.into(),
        tx_hash: model.tx_hash,
        error: model.error,
        attempts: u32::try_from(model.attempts).map_err(StorageError::from_source)?,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn usd_column(usd_value: u64) -> StorageResult<i64> {
    i64::try_from(usd_value).map_err(StorageError::from_source)
}

#[async_trait::async_trait]
impl DistributionStore for SeaOrmStorage {
    async fn find_recent_distribution(
        &self,
        donor: &Address,
        usd_value: u64,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<DistributionRecord>> {
        let found = distributions::Entity::find()
            .filter(distributions::Column::DonorAddress.eq(address_key(donor)))
            .filter(distributions::Column::UsdValue.eq(usd_column(usd_value)?))
            .filter(distributions::Column::CreatedAt.gte(since))
            .order_by_desc(distributions::Column::CreatedAt)
            .order_by_desc(distributions::Column::Id)
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        found.map(to_record).transpose()
    }

    async fn insert_distribution(&self, record: NewDistribution) -> StorageResult<i64> {
        let model = distributions::ActiveModel {
            donor_address: Set(record.donor_address),
            usd_value: Set(usd_column(record.usd_value)?),
            token_amount: Set(record.token_amount),
            status: Set(DistributionStatusDb::Pending),
            tx_hash: Set(None),
            error: Set(None),
            attempts: Set(0),
            created_at: Set(record.created_at),
            updated_at: Set(record.created_at),
            ..Default::default()
        };
        let inserted = distributions::Entity::insert(model)
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(inserted.last_insert_id)
    }

    async fn record_submission(&self, id: i64, tx_hash: &str, attempt: u32) -> StorageResult<()> {
        let attempts = i32::try_from(attempt).map_err(StorageError::from_source)?;
        let result = distributions::Entity::update_many()
            .col_expr(distributions::Column::TxHash, Expr::value(tx_hash.to_string()))
            .col_expr(distributions::Column::Attempts, Expr::value(attempts))
            .col_expr(distributions::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(distributions::Column::Id.eq(id))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn finalize_distribution(
        &self,
        id: i64,
        update: DistributionUpdate,
    ) -> StorageResult<()> {
        let status = DistributionStatusDb::from(update.status);
        let mut query = distributions::Entity::update_many()
            .col_expr(distributions::Column::Status, Expr::value(status))
            .col_expr(distributions::Column::Error, Expr::value(update.error))
            .col_expr(distributions::Column::UpdatedAt, Expr::value(Utc::now()));
        // A finalize without a hash keeps whatever the last submission stored.
        if let Some(hash) = update.tx_hash {
            query = query.col_expr(distributions::Column::TxHash, Expr::value(hash));
        }
        let result = query
            .filter(distributions::Column::Id.eq(id))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound(id));
        }
        Ok(())
    }

    async fn distribution_totals(&self) -> StorageResult<DistributionTotals> {
        let amounts: Vec<String> = distributions::Entity::find()
            .select_only()
            .column(distributions::Column::TokenAmount)
            .filter(distributions::Column::Status.eq(DistributionStatusDb::Distributed))
            .into_tuple()
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        let mut totals = DistributionTotals::default();
        for amount in amounts {
            let value = U256::from_str_radix(&amount, 10).map_err(StorageError::from_source)?;
            totals.count += 1;
            totals.tokens = totals.tokens.saturating_add(value);
        }
        Ok(totals)
    }
}
