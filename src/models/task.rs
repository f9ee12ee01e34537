use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::text_enum;
use crate::error::AppError;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
pub const MAX_TAG_LEN: usize = 50;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_NOTES_LEN: usize = 2000;
/// Reminders fire at most a year (leap year included) ahead of the due date.
pub const MAX_REMINDER_OFFSET_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Personal,
    Health,
    Finance,
    Education,
    Shopping,
    #[default]
    Other,
}

text_enum!(Category {
    Work => "work",
    Personal => "personal",
    Health => "health",
    Finance => "finance",
    Education => "education",
    Shopping => "shopping",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

text_enum!(TaskStatus {
    Pending => "pending",
    InProgress => "in-progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// When a reminder fires, relative to the task's due date or as an
/// absolute instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reminder {
    Offset { minutes: i64 },
    At { at: DateTime<Utc> },
}

impl Reminder {
    /// `None` when the trigger falls outside the representable time range.
    pub fn trigger_for(&self, due_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Reminder::Offset { minutes } => {
                due_at.checked_sub_signed(TimeDelta::try_minutes(*minutes)?)
            }
            Reminder::At { at } => Some(*at),
        }
    }

    /// The same reminder for an occurrence that moved from `old_due` to
    /// `new_due`. Absolute reminders keep their distance to the due date.
    pub fn shifted(&self, old_due: DateTime<Utc>, new_due: DateTime<Utc>) -> Option<Reminder> {
        match self {
            Reminder::Offset { .. } => Some(*self),
            Reminder::At { at } => Some(Reminder::At {
                at: at.checked_add_signed(new_due.signed_duration_since(old_due))?,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

text_enum!(RecurrenceKind {
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
    Yearly => "yearly",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub kind: RecurrenceKind,
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// 0 = Sunday .. 6 = Saturday. Only meaningful for weekly patterns.
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Day of month the pattern returns to after a shorter month clamped it.
    /// Filled from the due date when the pattern is set.
    #[serde(default)]
    pub anchor_day: Option<u32>,
}

fn default_interval() -> u32 {
    1
}

impl RecurrencePattern {
    pub fn new(kind: RecurrenceKind, interval: u32) -> Self {
        Self {
            kind,
            interval,
            days_of_week: Vec::new(),
            end_date: None,
            anchor_day: None,
        }
    }

    pub fn with_days_of_week(mut self, days: impl IntoIterator<Item = u8>) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    pub fn with_end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn validate(&self, due_at: DateTime<Utc>) -> Result<(), AppError> {
        if self.interval < 1 {
            return Err(AppError::validation("recurrence interval must be at least 1"));
        }
        if self.days_of_week.iter().any(|d| *d > 6) {
            return Err(AppError::validation("days_of_week entries must be between 0 and 6"));
        }
        if self.anchor_day.is_some_and(|day| !(1..=31).contains(&day)) {
            return Err(AppError::validation("anchor_day must be between 1 and 31"));
        }
        if let Some(end) = self.end_date {
            if end < due_at {
                return Err(AppError::validation("recurrence end_date is before due_date"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubtask {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Category,
    pub priority: Priority,
    pub status: TaskStatus,
    pub due_date: DateTime<Utc>,
    pub reminder: Option<Reminder>,
    pub recurrence: Option<RecurrencePattern>,
    pub tags: Vec<String>,
    pub subtasks: Vec<Subtask>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    /// Trigger times of every reminder occurrence already fired, oldest first.
    pub reminders_sent: Vec<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every write; writes are rejected when it moved since the read.
    #[serde(default)]
    pub version: i64,
}

impl Task {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn reminder_trigger_at(&self) -> Option<DateTime<Utc>> {
        self.reminder.and_then(|r| r.trigger_for(self.due_date))
    }

    /// Whether the current occurrence's reminder is due and has not fired yet.
    pub fn reminder_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.accepts_reminders() {
            return None;
        }
        let trigger = self.reminder_trigger_at()?;
        if trigger > now || self.reminders_sent.contains(&trigger) {
            return None;
        }
        Some(trigger)
    }

    pub fn accepts_reminders(&self) -> bool {
        !self.is_archived
            && !matches!(self.status, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status != TaskStatus::Completed && now > self.due_date
    }

    /// Percentage of completed subtasks; tasks without subtasks are 0 or 100.
    pub fn progress(&self) -> u8 {
        if self.subtasks.is_empty() {
            return if self.status == TaskStatus::Completed { 100 } else { 0 };
        }
        let done = self.subtasks.iter().filter(|s| s.completed).count();
        ((done * 100 + self.subtasks.len() / 2) / self.subtasks.len()) as u8
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(AppError::validation("title is required"));
        }
        check_len("title", title, MAX_TITLE_LEN)?;
        if let Some(description) = &self.description {
            check_len("description", description, MAX_DESCRIPTION_LEN)?;
        }
        if let Some(location) = &self.location {
            check_len("location", location, MAX_LOCATION_LEN)?;
        }
        if let Some(notes) = &self.notes {
            check_len("notes", notes, MAX_NOTES_LEN)?;
        }
        for tag in &self.tags {
            check_len("tag", tag, MAX_TAG_LEN)?;
        }
        for subtask in &self.subtasks {
            if subtask.title.trim().is_empty() {
                return Err(AppError::validation("subtask title is required"));
            }
            check_len("subtask title", &subtask.title, MAX_TITLE_LEN)?;
        }
        if let Some(Reminder::Offset { minutes }) = self.reminder {
            if minutes < 0 {
                return Err(AppError::validation("reminder offset must not be negative"));
            }
            if minutes > MAX_REMINDER_OFFSET_MINUTES {
                return Err(AppError::validation(format!(
                    "reminder offset must be at most {} minutes",
                    MAX_REMINDER_OFFSET_MINUTES
                )));
            }
        }
        if self.reminder.is_some() && self.reminder_trigger_at().is_none() {
            return Err(AppError::validation("reminder time is out of range"));
        }
        if let Some(pattern) = &self.recurrence {
            pattern.validate(self.due_date)?;
        }
        Ok(())
    }

    /// Derived state transitions that must hold after every write:
    /// a non-empty, fully completed subtask list completes the task, and
    /// `completed_at` tracks entry into and exit from `completed`.
    pub fn apply_transitions(&mut self, now: DateTime<Utc>) {
        if !self.subtasks.is_empty()
            && self.subtasks.iter().all(|s| s.completed)
            && self.status != TaskStatus::Completed
        {
            self.status = TaskStatus::Completed;
        }

        if self.status == TaskStatus::Completed {
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else {
            self.completed_at = None;
        }
    }

    pub fn set_subtask_completed(
        &mut self,
        index: usize,
        completed: bool,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let subtask = self.subtasks.get_mut(index).ok_or(AppError::NotFound)?;
        if subtask.completed != completed {
            subtask.completed = completed;
            subtask.completed_at = completed.then_some(now);
        }
        Ok(())
    }

    /// Moves the task onto its next occurrence, shifting an absolute
    /// reminder along with the due date. Leaves the task untouched when the
    /// shifted reminder would be out of range.
    pub fn advance_to(&mut self, next_due: DateTime<Utc>) -> Result<(), AppError> {
        if let Some(reminder) = self.reminder {
            let shifted = reminder
                .shifted(self.due_date, next_due)
                .ok_or_else(|| AppError::validation("reminder time is out of range"))?;
            self.reminder = Some(shifted);
        }
        self.due_date = next_due;
        self.status = TaskStatus::Pending;
        self.completed_at = None;
        for subtask in &mut self.subtasks {
            subtask.completed = false;
            subtask.completed_at = None;
        }
        Ok(())
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), AppError> {
    if value.chars().count() > max {
        return Err(AppError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub priority: Priority,
    pub due_date: DateTime<Utc>,
    #[serde(default)]
    pub reminder: Option<Reminder>,
    #[serde(default)]
    pub recurrence: Option<RecurrencePattern>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<NewSubtask>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewTaskRequest {
    pub fn new(title: impl Into<String>, due_date: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: None,
            category: Category::default(),
            priority: Priority::default(),
            due_date,
            reminder: None,
            recurrence: None,
            tags: Vec::new(),
            subtasks: Vec::new(),
            location: None,
            notes: None,
        }
    }

    pub fn with_reminder(mut self, reminder: Reminder) -> Self {
        self.reminder = Some(reminder);
        self
    }

    pub fn with_recurrence(mut self, recurrence: RecurrencePattern) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_subtasks<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subtasks = titles
            .into_iter()
            .map(|title| NewSubtask { title: title.into() })
            .collect();
        self
    }
}

/// Partial update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub status: Option<TaskStatus>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, with = "double_option")]
    pub reminder: Option<Option<Reminder>>,
    #[serde(default, with = "double_option")]
    pub recurrence: Option<Option<RecurrencePattern>>,
    pub tags: Option<Vec<String>>,
    pub subtasks: Option<Vec<Subtask>>,
    #[serde(default, with = "double_option")]
    pub location: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub notes: Option<Option<String>>,
    pub is_archived: Option<bool>,
}

impl UpdateTaskRequest {
    pub fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(category) = self.category {
            task.category = category;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(reminder) = self.reminder {
            task.reminder = reminder;
        }
        if let Some(recurrence) = self.recurrence {
            task.recurrence = recurrence;
        }
        if let Some(tags) = self.tags {
            task.tags = tags;
        }
        if let Some(subtasks) = self.subtasks {
            task.subtasks = subtasks;
        }
        if let Some(location) = self.location {
            task.location = location;
        }
        if let Some(notes) = self.notes {
            task.notes = notes;
        }
        if let Some(is_archived) = self.is_archived {
            task.is_archived = is_archived;
        }
    }
}

/// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub due_from: Option<DateTime<Utc>>,
    pub due_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub pending_tasks: i64,
    pub overdue_tasks: i64,
    pub completion_rate: i64,
}
