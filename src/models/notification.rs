use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::text_enum;
use crate::error::AppError;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Reminder,
    Overdue,
    Completed,
    Assigned,
    Comment,
    Test,
}

text_enum!(NotificationKind {
    Reminder => "reminder",
    Overdue => "overdue",
    Completed => "completed",
    Assigned => "assigned",
    Comment => "comment",
    Test => "test",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMethod {
    Push,
    Email,
    Sms,
    #[default]
    InApp,
}

text_enum!(DeliveryMethod {
    Push => "push",
    Email => "email",
    Sms => "sms",
    InApp => "in-app",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub owner: String,
    /// Absent only for notifications not tied to a task (e.g. test sends).
    pub task_id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub delivery_method: DeliveryMethod,
    pub scheduled_for: DateTime<Utc>,
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Set once retries are exhausted; the row is never retried again.
    pub delivery_failed: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to insert a notification in the undelivered state.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub owner: String,
    pub task_id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub delivery_method: DeliveryMethod,
    pub scheduled_for: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewNotification {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.title.trim().is_empty() || self.message.trim().is_empty() {
            return Err(AppError::validation("notification title and message are required"));
        }
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(AppError::validation(format!(
                "notification title must be at most {} characters",
                MAX_TITLE_LEN
            )));
        }
        if self.message.chars().count() > MAX_MESSAGE_LEN {
            return Err(AppError::validation(format!(
                "notification message must be at most {} characters",
                MAX_MESSAGE_LEN
            )));
        }
        if self.task_id.is_none() && self.kind != NotificationKind::Test {
            return Err(AppError::validation(format!(
                "{} notifications must reference a task",
                self.kind
            )));
        }
        Ok(())
    }

    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::new_v4().to_string(),
            owner: self.owner,
            task_id: self.task_id,
            kind: self.kind,
            title: self.title,
            message: self.message,
            delivery_method: self.delivery_method,
            scheduled_for: self.scheduled_for,
            is_delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            delivery_attempts: 0,
            last_error: None,
            next_attempt_at: None,
            delivery_failed: false,
            metadata: self.metadata,
            created_at: now,
        }
    }
}

impl Notification {
    /// Counts a delivery attempt as started and leases the row until
    /// `lease_until`. A row whose attempt never reports back becomes due for
    /// retry once the lease runs out.
    pub fn start_attempt(&mut self, lease_until: DateTime<Utc>) {
        self.delivery_attempts += 1;
        self.next_attempt_at = Some(lease_until);
    }
}

/// Truncates to `max` characters, appending an ellipsis when cut.
pub fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}
