use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::ScanConfig;
use crate::db::{notification_repository, task_repository};
use crate::error::AppError;
use crate::models::notification::{MAX_MESSAGE_LEN, MAX_TITLE_LEN, clip};
use crate::models::{NewNotification, NotificationKind, Task};
use crate::services::dispatch::Dispatcher;
use crate::services::recurrence::{self, RecurrenceOutcome};

/// Upper bound on rows picked up per tick; the rest waits for the next one.
const SCAN_BATCH_SIZE: i64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    /// Reminder occurrences claimed (one notification each).
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Earlier failed deliveries attempted again this tick.
    pub retried: usize,
    /// Candidates another scan or an edit got to first.
    pub skipped: usize,
    /// Candidates whose processing errored; isolated from the rest.
    pub errors: usize,
}

impl ScanStats {
    fn record_delivery(&mut self, delivered: bool) {
        if delivered {
            self.delivered += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub struct ReminderScanner {
    db: SqlitePool,
    dispatcher: Arc<Dispatcher>,
    clock: SharedClock,
    day_boundary: FixedOffset,
    concurrency: usize,
}

impl ReminderScanner {
    pub fn new(
        db: SqlitePool,
        dispatcher: Arc<Dispatcher>,
        clock: SharedClock,
        day_boundary: FixedOffset,
        config: &ScanConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            clock,
            day_boundary,
            concurrency: config.concurrency.max(1),
        }
    }

    /// One pass: retries that are due, then every reminder occurrence whose
    /// trigger time has passed and has not fired yet.
    pub async fn scan_once(&self) -> Result<ScanStats, AppError> {
        let now = self.clock.utc();
        let mut stats = ScanStats::default();

        let retries = notification_repository::fetch_retry_due(&self.db, now, SCAN_BATCH_SIZE).await?;
        for chunk in retries.chunks(self.concurrency) {
            let results = join_all(chunk.iter().map(|n| self.dispatcher.redeliver(n))).await;
            for (notification, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(delivered)) => {
                        stats.retried += 1;
                        stats.record_delivery(delivered);
                    }
                    Ok(None) => stats.skipped += 1,
                    Err(e) => {
                        stats.errors += 1;
                        warn!(
                            notification_id = %notification.id,
                            owner = %notification.owner,
                            "retry failed: {}",
                            e
                        );
                    }
                }
            }
        }

        let candidates = task_repository::fetch_reminder_candidates(&self.db, now, SCAN_BATCH_SIZE).await?;
        for chunk in candidates.chunks(self.concurrency) {
            let results = join_all(chunk.iter().map(|task| self.fire_reminder(task, now))).await;
            for (task, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(delivered)) => {
                        stats.claimed += 1;
                        stats.record_delivery(delivered);
                    }
                    Ok(None) => stats.skipped += 1,
                    Err(e) => {
                        stats.errors += 1;
                        warn!(task_id = %task.id, owner = %task.owner, "reminder processing failed: {}", e);
                    }
                }
            }
        }

        if stats != ScanStats::default() {
            info!(
                "Reminder scan completed - claimed: {}, delivered: {}, failed: {}, retried: {}, skipped: {}, errors: {}",
                stats.claimed, stats.delivered, stats.failed, stats.retried, stats.skipped, stats.errors
            );
        }
        Ok(stats)
    }

    /// Claims the task's current occurrence and delivers its notification.
    /// A recurring task moves past every occurrence already missed, so one
    /// notification covers them. `Ok(None)` means nothing was claimed.
    async fn fire_reminder(&self, task: &Task, now: DateTime<Utc>) -> Result<Option<bool>, AppError> {
        let Some(trigger_at) = task.reminder_due(now) else {
            return Ok(None);
        };

        let delivery_method = self.dispatcher.choose_method(&task.owner).await?;

        let mut advanced = None;
        let mut skipped = 0;
        if task.is_recurring() {
            let mut next = task.clone();
            match recurrence::advance_past(&mut next, self.day_boundary, now) {
                Some((RecurrenceOutcome::Advanced { from, to }, missed)) => {
                    skipped = missed;
                    debug!(task_id = %task.id, "recurring task advanced from {} to {}", from, to);
                }
                Some((RecurrenceOutcome::Ended, missed)) => {
                    skipped = missed;
                    debug!(task_id = %task.id, "recurrence ended, task completed");
                }
                None => {}
            }
            advanced = Some(next);
        }

        let new = NewNotification {
            owner: task.owner.clone(),
            task_id: Some(task.id.clone()),
            kind: NotificationKind::Reminder,
            title: clip(&format!("Task Reminder: {}", task.title), MAX_TITLE_LEN),
            message: clip(&self.reminder_message(task), MAX_MESSAGE_LEN),
            delivery_method,
            scheduled_for: trigger_at,
            metadata: reminder_metadata(task, skipped),
        };
        new.validate()?;
        let mut notification = new.into_notification(now);
        self.dispatcher.start_first_attempt(&mut notification, now);

        let claimed = task_repository::claim_reminder_occurrence(
            &self.db,
            task,
            trigger_at,
            &notification,
            advanced.as_ref(),
            now,
        )
        .await?;
        if !claimed {
            debug!(task_id = %task.id, "occurrence at {} already claimed or task changed", trigger_at);
            return Ok(None);
        }
        if skipped > 0 {
            info!(task_id = %task.id, owner = %task.owner, "skipped {} missed occurrences", skipped);
        }

        let delivered = self.dispatcher.dispatch(&notification).await?;
        Ok(Some(delivered))
    }

    fn reminder_message(&self, task: &Task) -> String {
        let due = task
            .due_date
            .with_timezone(&self.day_boundary)
            .format("%Y-%m-%d %H:%M");
        format!("{} is due {} ({} priority)", task.title, due, task.priority)
    }
}

fn reminder_metadata(task: &Task, skipped: usize) -> serde_json::Map<String, serde_json::Value> {
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "dueDate".to_string(),
        serde_json::Value::String(task.due_date.to_rfc3339()),
    );
    metadata.insert(
        "priority".to_string(),
        serde_json::Value::String(task.priority.to_string()),
    );
    metadata.insert(
        "category".to_string(),
        serde_json::Value::String(task.category.to_string()),
    );
    if skipped > 0 {
        metadata.insert("skippedOccurrences".to_string(), serde_json::Value::from(skipped));
    }
    metadata
}
