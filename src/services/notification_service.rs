use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::clock::SharedClock;
use crate::db::{notification_repository, settings_repository};
use crate::error::AppError;
use crate::models::{NewNotification, Notification, NotificationKind, UpdateSettingsRequest, UserSettings};
use crate::services::dispatch::Dispatcher;

/// Default page size for notification listings.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Debug, Serialize)]
pub struct TestSendResult {
    pub notification: Notification,
    pub delivered: bool,
}

/// Owner-scoped notification operations plus delivery settings.
#[derive(Clone)]
pub struct NotificationService {
    db: SqlitePool,
    dispatcher: Arc<Dispatcher>,
    clock: SharedClock,
}

impl NotificationService {
    pub fn new(db: SqlitePool, dispatcher: Arc<Dispatcher>, clock: SharedClock) -> Self {
        Self {
            db,
            dispatcher,
            clock,
        }
    }

    pub async fn list(
        &self,
        owner: &str,
        unread_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<Notification>, AppError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 200);
        notification_repository::list_notifications(&self.db, owner, unread_only, limit).await
    }

    pub async fn unread_count(&self, owner: &str) -> Result<i64, AppError> {
        notification_repository::unread_count(&self.db, owner).await
    }

    async fn get(&self, owner: &str, id: &str) -> Result<Notification, AppError> {
        let notification = notification_repository::find_notification(&self.db, id)
            .await?
            .ok_or(AppError::NotFound)?;
        if notification.owner != owner {
            return Err(AppError::Forbidden);
        }
        Ok(notification)
    }

    /// Idempotent: reading an already read notification keeps its first
    /// `read_at`.
    pub async fn mark_read(&self, owner: &str, id: &str) -> Result<Notification, AppError> {
        self.get(owner, id).await?;
        notification_repository::mark_read(&self.db, id, self.clock.utc()).await?;
        self.get(owner, id).await
    }

    pub async fn mark_all_read(&self, owner: &str) -> Result<u64, AppError> {
        notification_repository::mark_all_read(&self.db, owner, self.clock.utc()).await
    }

    pub async fn delete(&self, owner: &str, id: &str) -> Result<(), AppError> {
        self.get(owner, id).await?;
        if !notification_repository::delete_notification(&self.db, owner, id).await? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn clear_all(&self, owner: &str) -> Result<u64, AppError> {
        let cleared = notification_repository::clear_all(&self.db, owner).await?;
        info!(owner, "cleared {} notifications", cleared);
        Ok(cleared)
    }

    /// Creates a `test` notification with no task and delivers it right away.
    pub async fn send_test(&self, owner: &str) -> Result<TestSendResult, AppError> {
        let now = self.clock.utc();
        let delivery_method = self.dispatcher.choose_method(owner).await?;

        let new = NewNotification {
            owner: owner.to_string(),
            task_id: None,
            kind: NotificationKind::Test,
            title: "Test Notification".to_string(),
            message: "This is a test notification from TaskReminder".to_string(),
            delivery_method,
            scheduled_for: now,
            metadata: serde_json::Map::new(),
        };
        new.validate()?;
        let mut notification = new.into_notification(now);
        self.dispatcher.start_first_attempt(&mut notification, now);
        notification_repository::insert_notification(&self.db, &notification).await?;

        let delivered = self.dispatcher.dispatch(&notification).await?;
        let notification = self.get(owner, &notification.id).await?;
        Ok(TestSendResult {
            notification,
            delivered,
        })
    }

    pub async fn settings(&self, owner: &str) -> Result<UserSettings, AppError> {
        settings_repository::get_settings(&self.db, owner).await
    }

    pub async fn update_settings(
        &self,
        owner: &str,
        req: UpdateSettingsRequest,
    ) -> Result<UserSettings, AppError> {
        if let Some(email) = &req.email {
            if !email.contains('@') {
                return Err(AppError::validation("email address is invalid"));
            }
        }
        settings_repository::update_settings(&self.db, owner, req, self.clock.utc()).await
    }

    /// Registering a token again makes it the preferred device.
    pub async fn register_device_token(
        &self,
        owner: &str,
        token: &str,
    ) -> Result<UserSettings, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::validation("device token must not be empty"));
        }
        settings_repository::add_device_token(&self.db, owner, token, self.clock.utc()).await?;
        info!(owner, "device token registered");
        self.settings(owner).await
    }

    pub async fn remove_device_token(&self, owner: &str, token: &str) -> Result<UserSettings, AppError> {
        if !settings_repository::remove_device_token(&self.db, owner, token).await? {
            return Err(AppError::NotFound);
        }
        self.settings(owner).await
    }
}
