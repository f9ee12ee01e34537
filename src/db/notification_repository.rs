use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, SqlitePool};

use crate::db::{from_millis, from_millis_opt, to_millis};
use crate::error::AppError;
use crate::models::Notification;

const NOTIFICATION_COLUMNS: &str = "id, owner, task_id, kind, title, message, \
    delivery_method, scheduled_for, is_delivered, delivered_at, is_read, read_at, \
    delivery_attempts, last_error, next_attempt_at, delivery_failed, metadata, created_at";

#[derive(Debug, FromRow)]
struct NotificationRow {
    id: String,
    owner: String,
    task_id: Option<String>,
    kind: String,
    title: String,
    message: String,
    delivery_method: String,
    scheduled_for: i64,
    is_delivered: bool,
    delivered_at: Option<i64>,
    is_read: bool,
    read_at: Option<i64>,
    delivery_attempts: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    delivery_failed: bool,
    metadata: String,
    created_at: i64,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        Ok(Notification {
            id: row.id,
            owner: row.owner,
            task_id: row.task_id,
            kind: row.kind.parse()?,
            title: row.title,
            message: row.message,
            delivery_method: row.delivery_method.parse()?,
            scheduled_for: from_millis(row.scheduled_for)?,
            is_delivered: row.is_delivered,
            delivered_at: from_millis_opt(row.delivered_at)?,
            is_read: row.is_read,
            read_at: from_millis_opt(row.read_at)?,
            delivery_attempts: row.delivery_attempts.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: from_millis_opt(row.next_attempt_at)?,
            delivery_failed: row.delivery_failed,
            metadata: serde_json::from_str(&row.metadata)?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn convert_all(rows: Vec<NotificationRow>) -> Result<Vec<Notification>, AppError> {
    rows.into_iter().map(Notification::try_from).collect()
}

pub async fn insert_notification<'e, E>(executor: E, n: &Notification) -> Result<(), AppError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let metadata = serde_json::to_string(&n.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO notifications
            (id, owner, task_id, kind, title, message, delivery_method, scheduled_for,
            is_delivered, delivered_at, is_read, read_at, delivery_attempts, last_error,
            next_attempt_at, delivery_failed, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        "#,
    )
    .bind(&n.id)
    .bind(&n.owner)
    .bind(&n.task_id)
    .bind(n.kind.as_str())
    .bind(&n.title)
    .bind(&n.message)
    .bind(n.delivery_method.as_str())
    .bind(to_millis(n.scheduled_for))
    .bind(n.is_delivered)
    .bind(n.delivered_at.map(to_millis))
    .bind(n.is_read)
    .bind(n.read_at.map(to_millis))
    .bind(i64::from(n.delivery_attempts))
    .bind(&n.last_error)
    .bind(n.next_attempt_at.map(to_millis))
    .bind(n.delivery_failed)
    .bind(metadata)
    .bind(to_millis(n.created_at))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn find_notification(db: &SqlitePool, id: &str) -> Result<Option<Notification>, AppError> {
    sqlx::query_as::<_, NotificationRow>(&format!(
        "SELECT {} FROM notifications WHERE id = ?1",
        NOTIFICATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(db)
    .await?
    .map(Notification::try_from)
    .transpose()
}

/// Newest first.
pub async fn list_notifications(
    db: &SqlitePool,
    owner: &str,
    unread_only: bool,
    limit: i64,
) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        "SELECT {} FROM notifications
        WHERE owner = ?1 AND (?2 = 0 OR is_read = 0)
        ORDER BY created_at DESC, id ASC
        LIMIT ?3",
        NOTIFICATION_COLUMNS
    ))
    .bind(owner)
    .bind(unread_only)
    .bind(limit)
    .fetch_all(db)
    .await?;

    convert_all(rows)
}

pub async fn list_for_task(db: &SqlitePool, task_id: &str) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        "SELECT {} FROM notifications WHERE task_id = ?1 ORDER BY scheduled_for ASC",
        NOTIFICATION_COLUMNS
    ))
    .bind(task_id)
    .fetch_all(db)
    .await?;

    convert_all(rows)
}

pub async fn unread_count(db: &SqlitePool, owner: &str) -> Result<i64, AppError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notifications WHERE owner = ?1 AND is_read = 0",
    )
    .bind(owner)
    .fetch_one(db)
    .await?;
    Ok(count)
}

/// Returns false when the notification was already read; `read_at` keeps
/// its first value.
pub async fn mark_read(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
    let affected = sqlx::query(
        "UPDATE notifications SET is_read = 1, read_at = ?2 WHERE id = ?1 AND is_read = 0",
    )
    .bind(id)
    .bind(to_millis(now))
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

pub async fn mark_all_read(db: &SqlitePool, owner: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
    let affected = sqlx::query(
        "UPDATE notifications SET is_read = 1, read_at = ?2 WHERE owner = ?1 AND is_read = 0",
    )
    .bind(owner)
    .bind(to_millis(now))
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected)
}

pub async fn delete_notification(db: &SqlitePool, owner: &str, id: &str) -> Result<bool, AppError> {
    let affected = sqlx::query("DELETE FROM notifications WHERE id = ?1 AND owner = ?2")
        .bind(id)
        .bind(owner)
        .execute(db)
        .await?
        .rows_affected();
    Ok(affected > 0)
}

pub async fn clear_all(db: &SqlitePool, owner: &str) -> Result<u64, AppError> {
    let affected = sqlx::query("DELETE FROM notifications WHERE owner = ?1")
        .bind(owner)
        .execute(db)
        .await?
        .rows_affected();
    Ok(affected)
}

/// Delivered is terminal: only an undelivered row transitions, so
/// `delivered_at` is written once. The attempt was counted when it started.
pub async fn mark_delivered(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
    let affected = sqlx::query(
        r#"
        UPDATE notifications
        SET is_delivered = 1,
            delivered_at = ?2,
            next_attempt_at = NULL,
            last_error = NULL
        WHERE id = ?1 AND is_delivered = 0
        "#,
    )
    .bind(id)
    .bind(to_millis(now))
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

/// Records how the attempt in flight failed. `next_attempt_at = None` gives
/// up on the row.
pub async fn record_delivery_failure(
    db: &SqlitePool,
    id: &str,
    error: &str,
    next_attempt_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE notifications
        SET last_error = ?2,
            next_attempt_at = ?3,
            delivery_failed = (?3 IS NULL)
        WHERE id = ?1 AND is_delivered = 0
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(next_attempt_at.map(to_millis))
    .execute(db)
    .await?;
    Ok(())
}

/// Undelivered notifications whose retry time or attempt lease has come,
/// oldest first.
pub async fn fetch_retry_due(
    db: &SqlitePool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Notification>, AppError> {
    let rows = sqlx::query_as::<_, NotificationRow>(&format!(
        "SELECT {} FROM notifications
        WHERE is_delivered = 0 AND delivery_failed = 0
          AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?1
        ORDER BY next_attempt_at ASC
        LIMIT ?2",
        NOTIFICATION_COLUMNS
    ))
    .bind(to_millis(now))
    .bind(limit)
    .fetch_all(db)
    .await?;

    convert_all(rows)
}

/// Takes ownership of a due retry: counts the attempt and leases the row
/// until `lease_until`. Only one caller can win for a given
/// `(id, next_attempt_at)`.
pub async fn claim_retry(
    db: &SqlitePool,
    id: &str,
    scheduled: DateTime<Utc>,
    lease_until: DateTime<Utc>,
) -> Result<bool, AppError> {
    let affected = sqlx::query(
        r#"
        UPDATE notifications
        SET next_attempt_at = ?3,
            delivery_attempts = delivery_attempts + 1
        WHERE id = ?1 AND next_attempt_at = ?2 AND is_delivered = 0 AND delivery_failed = 0
        "#,
    )
    .bind(id)
    .bind(to_millis(scheduled))
    .bind(to_millis(lease_until))
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected > 0)
}

/// Marks a due row as permanently failed without another attempt. Same
/// compare-and-set as [`claim_retry`].
pub async fn give_up(
    db: &SqlitePool,
    id: &str,
    scheduled: DateTime<Utc>,
    reason: &str,
) -> Result<bool, AppError> {
    let affected = sqlx::query(
        r#"
        UPDATE notifications
        SET delivery_failed = 1,
            next_attempt_at = NULL,
            last_error = COALESCE(last_error, ?3)
        WHERE id = ?1 AND next_attempt_at = ?2 AND is_delivered = 0
        "#,
    )
    .bind(id)
    .bind(to_millis(scheduled))
    .bind(reason)
    .execute(db)
    .await?
    .rows_affected();
    Ok(affected > 0)
}
