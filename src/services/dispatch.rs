use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::RetryPolicy;
use crate::db::notification_repository;
use crate::delivery::{DeliveryGateway, DeliveryMessage, DeliveryOutcome};
use crate::error::AppError;
use crate::models::{DeliveryMethod, Notification};
use crate::services::settings::UserSettingsProvider;

/// Hands stored notifications to the gateway and records the outcome.
pub struct Dispatcher {
    db: SqlitePool,
    gateway: Arc<dyn DeliveryGateway>,
    settings: Arc<dyn UserSettingsProvider>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        db: SqlitePool,
        gateway: Arc<dyn DeliveryGateway>,
        settings: Arc<dyn UserSettingsProvider>,
        clock: SharedClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            gateway,
            settings,
            clock,
            retry,
        }
    }

    /// How a new notification for `owner` should be delivered, given their
    /// settings and the transports this process has.
    pub async fn choose_method(&self, owner: &str) -> Result<DeliveryMethod, AppError> {
        let settings = self.settings.settings(owner).await?;
        let (method, _) = settings.delivery_target(|method| self.gateway.supports(method));
        Ok(method)
    }

    /// Counts the first attempt on a notification that is about to be
    /// stored, so a process that dies before recording the outcome leaves a
    /// row that is retried once the lease runs out.
    pub fn start_first_attempt(&self, notification: &mut Notification, now: DateTime<Utc>) {
        notification.start_attempt(now + self.retry.lease);
    }

    /// Performs the attempt already counted on `notification`. Returns
    /// whether the notification is now delivered; gateway failures schedule a
    /// retry or give up per the retry policy and are not errors.
    pub async fn dispatch(&self, notification: &Notification) -> Result<bool, AppError> {
        let outcome = match self.settings.settings(&notification.owner).await {
            Ok(settings) => {
                let target = settings.target_for(notification.delivery_method);
                let message = DeliveryMessage::for_notification(notification, target);
                self.gateway.deliver(&message).await
            }
            Err(e) => DeliveryOutcome::Failed(format!("settings unavailable: {}", e)),
        };

        let now = self.clock.utc();
        match outcome {
            DeliveryOutcome::Delivered => {
                notification_repository::mark_delivered(&self.db, &notification.id, now).await?;
                debug!(
                    "notification {} delivered via {}",
                    notification.id, notification.delivery_method
                );
                Ok(true)
            }
            DeliveryOutcome::Failed(reason) => {
                self.record_failure(notification, &reason, now).await?;
                Ok(false)
            }
        }
    }

    async fn record_failure(
        &self,
        notification: &Notification,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let attempts = notification.delivery_attempts;
        let next_attempt_at = self.retry.next_delay(attempts).map(|delay| now + delay);
        match next_attempt_at {
            Some(at) => warn!(
                notification_id = %notification.id,
                owner = %notification.owner,
                attempts,
                "delivery failed, retrying at {}: {}",
                at,
                reason
            ),
            None => warn!(
                notification_id = %notification.id,
                owner = %notification.owner,
                attempts,
                "delivery failed permanently: {}",
                reason
            ),
        }
        notification_repository::record_delivery_failure(
            &self.db,
            &notification.id,
            reason,
            next_attempt_at,
        )
        .await
    }

    /// Re-attempts a notification whose retry time or lease has come. Returns
    /// `None` when another scan already took this retry. A row that has used
    /// up its attempts, because the last one never reported back, is marked
    /// failed instead.
    pub async fn redeliver(&self, notification: &Notification) -> Result<Option<bool>, AppError> {
        let Some(scheduled) = notification.next_attempt_at else {
            return Ok(None);
        };

        if notification.delivery_attempts >= self.retry.max_attempts {
            if !notification_repository::give_up(&self.db, &notification.id, scheduled, "delivery attempt interrupted")
                .await?
            {
                return Ok(None);
            }
            warn!(
                notification_id = %notification.id,
                owner = %notification.owner,
                attempts = notification.delivery_attempts,
                "delivery abandoned after an interrupted final attempt"
            );
            return Ok(Some(false));
        }

        let lease_until = self.clock.utc() + self.retry.lease;
        if !notification_repository::claim_retry(&self.db, &notification.id, scheduled, lease_until).await? {
            return Ok(None);
        }
        let mut claimed = notification.clone();
        claimed.delivery_attempts += 1;
        claimed.next_attempt_at = Some(lease_until);
        self.dispatch(&claimed).await.map(Some)
    }
}
