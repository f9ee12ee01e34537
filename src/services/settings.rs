use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::settings_repository;
use crate::error::AppError;
use crate::models::UserSettings;

/// Source of per-user delivery preferences.
#[async_trait]
pub trait UserSettingsProvider: Send + Sync {
    async fn settings(&self, owner: &str) -> Result<UserSettings, AppError>;
}

pub struct SqliteSettingsProvider {
    db: SqlitePool,
}

impl SqliteSettingsProvider {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserSettingsProvider for SqliteSettingsProvider {
    async fn settings(&self, owner: &str) -> Result<UserSettings, AppError> {
        settings_repository::get_settings(&self.db, owner).await
    }
}
