use chainops_domain::storage::{SettingsStore, StorageError, StorageResult};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{EntityTrait, Set};

use crate::entity::settings;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl SettingsStore for SeaOrmStorage {
    async fn setting(&self, key: &str) -> StorageResult<Option<String>> {
        let row = settings::Entity::find_by_id(key.to_string())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(row.map(|model| model.value))
    }

    async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        let model = settings::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
            updated_at: Set(Utc::now()),
        };
        settings::Entity::insert(model)
            .on_conflict(
                OnConflict::column(settings::Column::Key)
                    .update_columns([settings::Column::Value, settings::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(())
    }
}
