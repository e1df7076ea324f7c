use sea_orm::sea_query::{ColumnDef, Expr, Index, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};

use crate::entity::{alerts, audit_log, distributions, settings};
use chainops_domain::storage::{StorageError, StorageResult};

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let distributions_table = Table::create()
        .table(distributions::Entity)
        .col(
            ColumnDef::new(distributions::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(distributions::Column::DonorAddress)
                .string_len(42)
                .not_null(),
        )
        .col(
            ColumnDef::new(distributions::Column::UsdValue)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(distributions::Column::TokenAmount)
                .string_len(80)
                .not_null(),
        )
        .col(
            ColumnDef::new(distributions::Column::Status)
                .tiny_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(distributions::Column::TxHash)
                .string_len(66)
                .null(),
        )
        .col(ColumnDef::new(distributions::Column::Error).text().null())
        .col(
            ColumnDef::new(distributions::Column::Attempts)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(distributions::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(distributions::Column::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, backend, distributions_table).await?;

    let donor_index = Index::create()
        .if_not_exists()
        .name("idx_distributions_donor_usd")
        .table(distributions::Entity)
        .col(distributions::Column::DonorAddress)
        .col(distributions::Column::UsdValue)
        .col(distributions::Column::CreatedAt)
        .to_owned();
    db.execute(backend.build(&donor_index))
        .await
        .map_err(StorageError::from_source)?;

    let audit_table = Table::create()
        .table(audit_log::Entity)
        .col(
            ColumnDef::new(audit_log::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(audit_log::Column::Kind).string_len(32).not_null())
        .col(
            ColumnDef::new(audit_log::Column::Network)
                .string_len(32)
                .not_null(),
        )
        .col(ColumnDef::new(audit_log::Column::Subject).string().not_null())
        .col(ColumnDef::new(audit_log::Column::Payload).json().not_null())
        .col(
            ColumnDef::new(audit_log::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, backend, audit_table).await?;

    let alerts_table = Table::create()
        .table(alerts::Entity)
        .col(
            ColumnDef::new(alerts::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(alerts::Column::Kind).string_len(32).not_null())
        .col(
            ColumnDef::new(alerts::Column::Severity)
                .string_len(16)
                .not_null(),
        )
        .col(ColumnDef::new(alerts::Column::Payload).json().not_null())
        .col(
            ColumnDef::new(alerts::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, backend, alerts_table).await?;

    let settings_table = Table::create()
        .table(settings::Entity)
        .col(
            ColumnDef::new(settings::Column::Key)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(settings::Column::Value).text().not_null())
        .col(
            ColumnDef::new(settings::Column::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, backend, settings_table).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}
