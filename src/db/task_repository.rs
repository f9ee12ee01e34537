use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::db::{from_millis, from_millis_opt, notification_repository, to_millis};
use crate::error::AppError;
use crate::models::{
    Notification, RecurrencePattern, Reminder, Task, TaskFilter, TaskStats, TaskStatus,
};

const TASK_COLUMNS: &str = "id, owner, title, description, category, priority, status, \
    due_at, reminder_offset_minutes, reminder_at, is_recurring, recurrence_kind, \
    recurrence_interval, recurrence_days, recurrence_end_at, recurrence_anchor_day, tags, \
    subtasks, location, notes, completed_at, is_archived, created_at, updated_at, version";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    owner: String,
    title: String,
    description: Option<String>,
    category: String,
    priority: String,
    status: String,
    due_at: i64,
    reminder_offset_minutes: Option<i64>,
    reminder_at: Option<i64>,
    is_recurring: bool,
    recurrence_kind: Option<String>,
    recurrence_interval: Option<i64>,
    recurrence_days: Option<String>,
    recurrence_end_at: Option<i64>,
    recurrence_anchor_day: Option<i64>,
    tags: String,
    subtasks: String,
    location: Option<String>,
    notes: Option<String>,
    completed_at: Option<i64>,
    is_archived: bool,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let reminder = match (row.reminder_offset_minutes, row.reminder_at) {
            (Some(minutes), _) => Some(Reminder::Offset { minutes }),
            (None, Some(at)) => Some(Reminder::At { at: from_millis(at)? }),
            (None, None) => None,
        };

        let recurrence = match (row.is_recurring, row.recurrence_kind) {
            (true, Some(kind)) => Some(RecurrencePattern {
                kind: kind.parse()?,
                interval: row.recurrence_interval.unwrap_or(1).max(1) as u32,
                days_of_week: match row.recurrence_days {
                    Some(days) => serde_json::from_str(&days)?,
                    None => Vec::new(),
                },
                end_date: from_millis_opt(row.recurrence_end_at)?,
                anchor_day: row
                    .recurrence_anchor_day
                    .and_then(|day| u32::try_from(day).ok()),
            }),
            _ => None,
        };

        Ok(Task {
            id: row.id,
            owner: row.owner,
            title: row.title,
            description: row.description,
            category: row.category.parse()?,
            priority: row.priority.parse()?,
            status: row.status.parse()?,
            due_date: from_millis(row.due_at)?,
            reminder,
            recurrence,
            tags: serde_json::from_str(&row.tags)?,
            subtasks: serde_json::from_str(&row.subtasks)?,
            location: row.location,
            notes: row.notes,
            completed_at: from_millis_opt(row.completed_at)?,
            is_archived: row.is_archived,
            reminders_sent: Vec::new(),
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            version: row.version,
        })
    }
}

/// Column values derived from a task before binding.
struct TaskColumns {
    reminder_offset_minutes: Option<i64>,
    reminder_at: Option<i64>,
    trigger_at: Option<i64>,
    recurrence_kind: Option<&'static str>,
    recurrence_interval: Option<i64>,
    recurrence_days: Option<String>,
    recurrence_end_at: Option<i64>,
    recurrence_anchor_day: Option<i64>,
    tags: String,
    subtasks: String,
}

impl TaskColumns {
    fn from_task(task: &Task) -> Result<Self, AppError> {
        let (reminder_offset_minutes, reminder_at) = match task.reminder {
            Some(Reminder::Offset { minutes }) => (Some(minutes), None),
            Some(Reminder::At { at }) => (None, Some(to_millis(at))),
            None => (None, None),
        };
        let recurrence = task.recurrence.as_ref();
        if task.reminder.is_some() && task.reminder_trigger_at().is_none() {
            return Err(AppError::validation("reminder time is out of range"));
        }
        Ok(Self {
            reminder_offset_minutes,
            reminder_at,
            trigger_at: task.reminder_trigger_at().map(to_millis),
            recurrence_kind: recurrence.map(|p| p.kind.as_str()),
            recurrence_interval: recurrence.map(|p| i64::from(p.interval)),
            recurrence_days: recurrence
                .map(|p| serde_json::to_string(&p.days_of_week))
                .transpose()?,
            recurrence_end_at: recurrence.and_then(|p| p.end_date).map(to_millis),
            recurrence_anchor_day: recurrence.and_then(|p| p.anchor_day).map(i64::from),
            tags: serde_json::to_string(&task.tags)?,
            subtasks: serde_json::to_string(&task.subtasks)?,
        })
    }
}

pub async fn insert_task(db: &SqlitePool, task: &Task) -> Result<(), AppError> {
    let cols = TaskColumns::from_task(task)?;

    sqlx::query(
        r#"
        INSERT INTO tasks
            (id, owner, title, description, category, priority, status, due_at,
            reminder_offset_minutes, reminder_at, trigger_at, is_recurring,
            recurrence_kind, recurrence_interval, recurrence_days, recurrence_end_at,
            recurrence_anchor_day, tags, subtasks, location, notes, completed_at,
            is_archived, created_at, updated_at, version)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
        "#,
    )
    .bind(&task.id)
    .bind(&task.owner)
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.category.as_str())
    .bind(task.priority.as_str())
    .bind(task.status.as_str())
    .bind(to_millis(task.due_date))
    .bind(cols.reminder_offset_minutes)
    .bind(cols.reminder_at)
    .bind(cols.trigger_at)
    .bind(task.is_recurring())
    .bind(cols.recurrence_kind)
    .bind(cols.recurrence_interval)
    .bind(cols.recurrence_days)
    .bind(cols.recurrence_end_at)
    .bind(cols.recurrence_anchor_day)
    .bind(cols.tags)
    .bind(cols.subtasks)
    .bind(&task.location)
    .bind(&task.notes)
    .bind(task.completed_at.map(to_millis))
    .bind(task.is_archived)
    .bind(to_millis(task.created_at))
    .bind(to_millis(task.updated_at))
    .bind(task.version)
    .execute(db)
    .await?;

    Ok(())
}

/// Writes every mutable column if the row is still at `task.version`, and
/// bumps the version. Owner and creation time never change. Returns the
/// number of rows written: 0 means the task is gone or changed since it
/// was read.
async fn write_task<'e, E>(executor: E, task: &Task) -> Result<u64, AppError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let cols = TaskColumns::from_task(task)?;

    let affected = sqlx::query(
        r#"
        UPDATE tasks
        SET title = ?1,
            description = ?2,
            category = ?3,
            priority = ?4,
            status = ?5,
            due_at = ?6,
            reminder_offset_minutes = ?7,
            reminder_at = ?8,
            trigger_at = ?9,
            is_recurring = ?10,
            recurrence_kind = ?11,
            recurrence_interval = ?12,
            recurrence_days = ?13,
            recurrence_end_at = ?14,
            recurrence_anchor_day = ?15,
            tags = ?16,
            subtasks = ?17,
            location = ?18,
            notes = ?19,
            completed_at = ?20,
            is_archived = ?21,
            updated_at = ?22,
            version = version + 1
        WHERE id = ?23 AND version = ?24
        "#,
    )
    .bind(&task.title)
    .bind(&task.description)
    .bind(task.category.as_str())
    .bind(task.priority.as_str())
    .bind(task.status.as_str())
    .bind(to_millis(task.due_date))
    .bind(cols.reminder_offset_minutes)
    .bind(cols.reminder_at)
    .bind(cols.trigger_at)
    .bind(task.is_recurring())
    .bind(cols.recurrence_kind)
    .bind(cols.recurrence_interval)
    .bind(cols.recurrence_days)
    .bind(cols.recurrence_end_at)
    .bind(cols.recurrence_anchor_day)
    .bind(cols.tags)
    .bind(cols.subtasks)
    .bind(&task.location)
    .bind(&task.notes)
    .bind(task.completed_at.map(to_millis))
    .bind(task.is_archived)
    .bind(to_millis(task.updated_at))
    .bind(&task.id)
    .bind(task.version)
    .execute(executor)
    .await?
    .rows_affected();

    Ok(affected)
}

/// Compare-and-set on `task.version`. False when the task was deleted or
/// written by someone else since it was read; the caller re-reads.
pub async fn update_task(db: &SqlitePool, task: &Task) -> Result<bool, AppError> {
    Ok(write_task(db, task).await? > 0)
}

pub async fn find_task(db: &SqlitePool, id: &str) -> Result<Option<Task>, AppError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {} FROM tasks WHERE id = ?1",
        TASK_COLUMNS
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;

    match row {
        Some(row) => Ok(Some(hydrate(db, row).await?)),
        None => Ok(None),
    }
}

pub async fn fetch_reminders_sent(
    db: &SqlitePool,
    task_id: &str,
) -> Result<Vec<DateTime<Utc>>, AppError> {
    let rows: Vec<i64> = sqlx::query_scalar(
        "SELECT trigger_at FROM reminders_sent WHERE task_id = ?1 ORDER BY trigger_at ASC",
    )
    .bind(task_id)
    .fetch_all(db)
    .await?;

    rows.into_iter().map(from_millis).collect()
}

async fn hydrate(db: &SqlitePool, row: TaskRow) -> Result<Task, AppError> {
    let mut task = Task::try_from(row)?;
    task.reminders_sent = fetch_reminders_sent(db, &task.id).await?;
    Ok(task)
}

async fn hydrate_all(db: &SqlitePool, rows: Vec<TaskRow>) -> Result<Vec<Task>, AppError> {
    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        tasks.push(hydrate(db, row).await?);
    }
    Ok(tasks)
}

/// Deletes the task together with its notifications and reminder audit.
/// Returns false when no task with this id belongs to `owner`.
pub async fn delete_task(db: &SqlitePool, owner: &str, id: &str) -> Result<bool, AppError> {
    let mut tx = db.begin().await?;

    let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?1 AND owner = ?2")
        .bind(id)
        .bind(owner)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Ok(false);
    }

    sqlx::query("DELETE FROM notifications WHERE task_id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM reminders_sent WHERE task_id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

pub async fn list_tasks(
    db: &SqlitePool,
    owner: &str,
    filter: &TaskFilter,
) -> Result<Vec<Task>, AppError> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM tasks WHERE owner = ",
        TASK_COLUMNS
    ));
    qb.push_bind(owner);

    if !filter.include_archived {
        qb.push(" AND is_archived = 0");
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(category) = filter.category {
        qb.push(" AND category = ").push_bind(category.as_str());
    }
    if let Some(priority) = filter.priority {
        qb.push(" AND priority = ").push_bind(priority.as_str());
    }
    if let Some(from) = filter.due_from {
        qb.push(" AND due_at >= ").push_bind(to_millis(from));
    }
    if let Some(to) = filter.due_to {
        qb.push(" AND due_at <= ").push_bind(to_millis(to));
    }
    qb.push(" ORDER BY due_at ASC");

    let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(db).await?;
    hydrate_all(db, rows).await
}

/// Tasks due in the half-open range `[from, to)`.
pub async fn fetch_tasks_due_between(
    db: &SqlitePool,
    owner: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Task>, AppError> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {} FROM tasks
        WHERE owner = ?1 AND is_archived = 0 AND due_at >= ?2 AND due_at < ?3
        ORDER BY due_at ASC",
        TASK_COLUMNS
    ))
    .bind(owner)
    .bind(to_millis(from))
    .bind(to_millis(to))
    .fetch_all(db)
    .await?;

    hydrate_all(db, rows).await
}

pub async fn fetch_overdue_tasks(
    db: &SqlitePool,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, AppError> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {} FROM tasks
        WHERE owner = ?1 AND is_archived = 0 AND due_at < ?2 AND status != 'completed'
        ORDER BY due_at ASC",
        TASK_COLUMNS
    ))
    .bind(owner)
    .bind(to_millis(now))
    .fetch_all(db)
    .await?;

    hydrate_all(db, rows).await
}

pub async fn task_stats(
    db: &SqlitePool,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<TaskStats, AppError> {
    let by_status: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks WHERE owner = ?1 GROUP BY status",
    )
    .bind(owner)
    .fetch_all(db)
    .await?;

    let overdue_tasks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE owner = ?1 AND due_at < ?2 AND status != 'completed'",
    )
    .bind(owner)
    .bind(to_millis(now))
    .fetch_one(db)
    .await?;

    let count_of = |status: TaskStatus| {
        by_status
            .iter()
            .find(|(s, _)| s == status.as_str())
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    let total_tasks: i64 = by_status.iter().map(|(_, n)| n).sum();
    let completed_tasks = count_of(TaskStatus::Completed);
    let completion_rate = if total_tasks > 0 {
        (completed_tasks * 100 + total_tasks / 2) / total_tasks
    } else {
        0
    };

    Ok(TaskStats {
        total_tasks,
        completed_tasks,
        pending_tasks: count_of(TaskStatus::Pending),
        overdue_tasks,
        completion_rate,
    })
}

/// Tasks across all owners whose current reminder occurrence is due at
/// `now` and has not been fired yet.
pub async fn fetch_reminder_candidates(
    db: &SqlitePool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Task>, AppError> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
        "SELECT {} FROM tasks
        WHERE trigger_at IS NOT NULL
          AND trigger_at <= ?1
          AND status NOT IN ('completed', 'cancelled')
          AND is_archived = 0
          AND NOT EXISTS (
              SELECT 1 FROM reminders_sent r
              WHERE r.task_id = tasks.id AND r.trigger_at = tasks.trigger_at
          )
        ORDER BY trigger_at ASC
        LIMIT ?2",
        TASK_COLUMNS
    ))
    .bind(to_millis(now))
    .bind(limit)
    .fetch_all(db)
    .await?;

    hydrate_all(db, rows).await
}

/// Records the reminder occurrence `(task.id, trigger_at)` as fired, creates
/// its notification and, when given, persists the task's next occurrence, all
/// in one transaction.
///
/// `task` is the snapshot the scanner worked from. Returns false without
/// writing anything when the occurrence was already claimed, the task no
/// longer has this trigger pending, or the task was written since the
/// snapshot was taken; the next scan picks up the fresh row.
pub async fn claim_reminder_occurrence(
    db: &SqlitePool,
    task: &Task,
    trigger_at: DateTime<Utc>,
    notification: &Notification,
    advanced: Option<&Task>,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let mut tx = db.begin().await?;

    // a write first, so the transaction holds the write lock before it
    // relies on anything it read
    let claimed = sqlx::query(
        r#"
        INSERT OR IGNORE INTO reminders_sent (task_id, trigger_at, sent_at)
        SELECT id, trigger_at, ?3 FROM tasks
        WHERE id = ?1 AND trigger_at = ?2 AND version = ?4 AND is_archived = 0
          AND status NOT IN ('completed', 'cancelled')
        "#,
    )
    .bind(&task.id)
    .bind(to_millis(trigger_at))
    .bind(to_millis(now))
    .bind(task.version)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if claimed == 0 {
        return Ok(false);
    }

    notification_repository::insert_notification(&mut *tx, notification).await?;
    if let Some(next) = advanced {
        if write_task(&mut *tx, next).await? == 0 {
            return Ok(false);
        }
    }

    tx.commit().await?;
    Ok(true)
}
