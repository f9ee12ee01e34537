use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::db::task_repository;
use crate::error::AppError;
use crate::models::{
    NewTaskRequest, Subtask, Task, TaskFilter, TaskStats, TaskStatus, UpdateTaskRequest,
};
use crate::services::recurrence::{self, RecurrenceOutcome};

/// Times a write is re-applied to a freshly read task before giving up.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Owner-scoped task operations. Every write validates the task and applies
/// the derived status transitions before it is persisted.
#[derive(Clone)]
pub struct TaskService {
    db: SqlitePool,
    clock: SharedClock,
    day_boundary: FixedOffset,
}

impl TaskService {
    pub fn new(db: SqlitePool, clock: SharedClock, day_boundary: FixedOffset) -> Self {
        Self {
            db,
            clock,
            day_boundary,
        }
    }

    pub async fn create(&self, owner: &str, req: NewTaskRequest) -> Result<Task, AppError> {
        let now = self.clock.utc();
        let mut task = Task {
            id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            title: req.title.trim().to_string(),
            description: req.description,
            category: req.category,
            priority: req.priority,
            status: TaskStatus::Pending,
            due_date: req.due_date,
            reminder: req.reminder,
            recurrence: req.recurrence,
            tags: req.tags,
            subtasks: req
                .subtasks
                .into_iter()
                .map(|s| Subtask {
                    title: s.title,
                    completed: false,
                    completed_at: None,
                })
                .collect(),
            location: req.location,
            notes: req.notes,
            completed_at: None,
            is_archived: false,
            reminders_sent: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        recurrence::anchor(&mut task, self.day_boundary);
        task.validate()?;
        task.apply_transitions(now);

        task_repository::insert_task(&self.db, &task).await?;
        info!(task_id = %task.id, owner, "task created");
        Ok(task)
    }

    /// `NotFound` when the task does not exist, `Forbidden` when it belongs
    /// to someone else.
    pub async fn get(&self, owner: &str, id: &str) -> Result<Task, AppError> {
        let task = task_repository::find_task(&self.db, id)
            .await?
            .ok_or(AppError::NotFound)?;
        if task.owner != owner {
            return Err(AppError::Forbidden);
        }
        Ok(task)
    }

    pub async fn update(
        &self,
        owner: &str,
        id: &str,
        req: UpdateTaskRequest,
    ) -> Result<Task, AppError> {
        let tz = self.day_boundary;
        self.modify(owner, id, |task, now| {
            let was_completed = task.status == TaskStatus::Completed;
            let reanchor = req.due_date.is_some() || req.recurrence.is_some();
            req.clone().apply(task);
            task.title = task.title.trim().to_string();
            if reanchor {
                recurrence::anchor(task, tz);
            }

            if !was_completed && task.status == TaskStatus::Completed && task.is_recurring() {
                finish_occurrence(task, tz, now);
            }
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, owner: &str, id: &str) -> Result<(), AppError> {
        self.get(owner, id).await?;
        if !task_repository::delete_task(&self.db, owner, id).await? {
            return Err(AppError::NotFound);
        }
        info!(task_id = %id, owner, "task deleted");
        Ok(())
    }

    /// Completing a recurring task moves it to its next occurrence instead,
    /// unless the pattern has ended.
    pub async fn complete(&self, owner: &str, id: &str) -> Result<Task, AppError> {
        let tz = self.day_boundary;
        self.modify(owner, id, |task, now| {
            mark_complete(task, tz, now);
            Ok(())
        })
        .await
    }

    /// Reopens the task. Subtasks that were all done are reopened too, since
    /// a fully checked list would complete the task again.
    pub async fn incomplete(&self, owner: &str, id: &str) -> Result<Task, AppError> {
        self.modify(owner, id, |task, _| {
            reopen(task);
            Ok(())
        })
        .await
    }

    pub async fn toggle_complete(&self, owner: &str, id: &str) -> Result<Task, AppError> {
        let tz = self.day_boundary;
        self.modify(owner, id, |task, now| {
            if task.status == TaskStatus::Completed {
                reopen(task);
            } else {
                mark_complete(task, tz, now);
            }
            Ok(())
        })
        .await
    }

    pub async fn set_subtask_completed(
        &self,
        owner: &str,
        id: &str,
        index: usize,
        completed: bool,
    ) -> Result<Task, AppError> {
        let tz = self.day_boundary;
        self.modify(owner, id, |task, now| {
            let was_completed = task.status == TaskStatus::Completed;
            task.set_subtask_completed(index, completed, now)?;

            let all_done = task.subtasks.iter().all(|s| s.completed);
            if !completed && was_completed {
                task.status = TaskStatus::Pending;
            } else if all_done && !was_completed && task.is_recurring() {
                task.status = TaskStatus::Completed;
                finish_occurrence(task, tz, now);
            }
            Ok(())
        })
        .await
    }

    pub async fn archive(&self, owner: &str, id: &str, archived: bool) -> Result<Task, AppError> {
        self.modify(owner, id, |task, _| {
            task.is_archived = archived;
            Ok(())
        })
        .await
    }

    pub async fn list(&self, owner: &str, filter: &TaskFilter) -> Result<Vec<Task>, AppError> {
        task_repository::list_tasks(&self.db, owner, filter).await
    }

    /// Tasks due between local midnight today and local midnight tomorrow.
    pub async fn due_today(&self, owner: &str) -> Result<Vec<Task>, AppError> {
        let start = self.start_of_day(self.clock.utc())?;
        task_repository::fetch_tasks_due_between(&self.db, owner, start, start + Duration::days(1))
            .await
    }

    /// Tasks due in the current week, which starts on Sunday.
    pub async fn due_this_week(&self, owner: &str) -> Result<Vec<Task>, AppError> {
        let now = self.clock.utc();
        let today = self.start_of_day(now)?;
        let weekday = now.with_timezone(&self.day_boundary).weekday();
        let start = today - Duration::days(i64::from(weekday.num_days_from_sunday()));
        task_repository::fetch_tasks_due_between(&self.db, owner, start, start + Duration::weeks(1))
            .await
    }

    pub async fn overdue(&self, owner: &str) -> Result<Vec<Task>, AppError> {
        task_repository::fetch_overdue_tasks(&self.db, owner, self.clock.utc()).await
    }

    pub async fn stats(&self, owner: &str) -> Result<TaskStats, AppError> {
        task_repository::task_stats(&self.db, owner, self.clock.utc()).await
    }

    fn start_of_day(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let local_date = now.with_timezone(&self.day_boundary).date_naive();
        self.day_boundary
            .from_local_datetime(&local_date.and_time(NaiveTime::MIN))
            .single()
            .map(|start| start.with_timezone(&Utc))
            .ok_or(AppError::InternalServerError)
    }

    /// Read, change, write with a version check. When the scanner or another
    /// request wrote the task in between, the change is applied again to the
    /// fresh row.
    async fn modify<F>(&self, owner: &str, id: &str, mut change: F) -> Result<Task, AppError>
    where
        F: FnMut(&mut Task, DateTime<Utc>) -> Result<(), AppError>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut task = self.get(owner, id).await?;
            let now = self.clock.utc();
            change(&mut task, now)?;
            task.validate()?;
            task.apply_transitions(now);
            task.updated_at = now;

            if task_repository::update_task(&self.db, &task).await? {
                task.version += 1;
                return Ok(task);
            }
            debug!(task_id = %id, "task changed since it was read, applying again");
        }
        Err(AppError::Conflict(format!(
            "task {} kept changing, try again",
            id
        )))
    }
}

fn mark_complete(task: &mut Task, tz: FixedOffset, now: DateTime<Utc>) {
    if task.is_recurring() && task.status != TaskStatus::Completed {
        finish_occurrence(task, tz, now);
    } else {
        task.status = TaskStatus::Completed;
    }
}

fn reopen(task: &mut Task) {
    task.status = TaskStatus::Pending;
    if !task.subtasks.is_empty() && task.subtasks.iter().all(|s| s.completed) {
        for subtask in &mut task.subtasks {
            subtask.completed = false;
            subtask.completed_at = None;
        }
    }
}

fn finish_occurrence(task: &mut Task, tz: FixedOffset, now: DateTime<Utc>) {
    match recurrence::advance(task, tz, now) {
        Some(RecurrenceOutcome::Advanced { from, to }) => {
            debug!(task_id = %task.id, "completed occurrence {}, next due {}", from, to);
        }
        Some(RecurrenceOutcome::Ended) => {
            debug!(task_id = %task.id, "recurrence ended");
        }
        None => {}
    }
}
