//! Next-occurrence computation for recurring tasks.
//!
//! Calendar arithmetic (weekdays, month lengths) happens in the configured
//! day-boundary offset so that "every Monday" means Monday for the user, not
//! Monday in UTC.

use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveDate, TimeDelta, Utc};

use crate::models::{RecurrenceKind, RecurrencePattern, Task, TaskStatus};

/// Upper bound on missed occurrences skipped in one catch-up.
const MAX_CATCH_UP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceOutcome {
    /// The task now points at its next occurrence.
    Advanced {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// The pattern is exhausted; the task was completed.
    Ended,
}

/// The first occurrence strictly after `current`, ignoring `end_date`.
/// `None` when it falls outside the representable range.
pub fn next_due_date(
    pattern: &RecurrencePattern,
    current: DateTime<Utc>,
    tz: FixedOffset,
) -> Option<DateTime<Utc>> {
    let interval = pattern.interval.max(1);
    let local = current.with_timezone(&tz);

    let next = match pattern.kind {
        RecurrenceKind::Daily => local.checked_add_signed(TimeDelta::try_days(i64::from(interval))?)?,
        RecurrenceKind::Weekly => next_weekly(local, interval, &pattern.days_of_week)?,
        RecurrenceKind::Monthly => add_months_anchored(local, interval, pattern.anchor_day)?,
        RecurrenceKind::Yearly => {
            add_months_anchored(local, interval.checked_mul(12)?, pattern.anchor_day)?
        }
    };

    Some(next.with_timezone(&Utc))
}

/// chrono clamps to the last day of a shorter month; the anchor pulls the
/// date back up once the month is long enough again.
fn add_months_anchored(
    local: DateTime<FixedOffset>,
    months: u32,
    anchor_day: Option<u32>,
) -> Option<DateTime<FixedOffset>> {
    let next = local.checked_add_months(Months::new(months))?;
    let Some(anchor) = anchor_day else {
        return Some(next);
    };
    let day = anchor.min(days_in_month(next.year(), next.month())?);
    if day == next.day() {
        return Some(next);
    }
    next.with_day(day)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(first.checked_add_months(Months::new(1))?.pred_opt()?.day())
}

fn next_weekly(
    local: DateTime<FixedOffset>,
    interval: u32,
    days_of_week: &[u8],
) -> Option<DateTime<FixedOffset>> {
    let mut days: Vec<u8> = days_of_week.iter().copied().filter(|d| *d <= 6).collect();
    days.sort_unstable();
    days.dedup();

    let weekday = local.weekday().num_days_from_sunday() as u8;
    let weeks = TimeDelta::try_weeks(i64::from(interval))?;
    let Some(first) = days.first().copied() else {
        return local.checked_add_signed(weeks);
    };

    if let Some(later) = days.iter().find(|d| **d > weekday) {
        return local.checked_add_signed(TimeDelta::days(i64::from(later - weekday)));
    }

    // weeks start on Sunday
    let week_start = local.checked_sub_signed(TimeDelta::days(i64::from(weekday)))?;
    week_start
        .checked_add_signed(weeks)?
        .checked_add_signed(TimeDelta::days(i64::from(first)))
}

/// Pins monthly and yearly patterns to the due date's local day of month.
/// Call whenever the pattern or the due date is set by the user.
pub fn anchor(task: &mut Task, tz: FixedOffset) {
    let day = task.due_date.with_timezone(&tz).day();
    if let Some(pattern) = task.recurrence.as_mut() {
        pattern.anchor_day = match pattern.kind {
            RecurrenceKind::Monthly | RecurrenceKind::Yearly => Some(day),
            RecurrenceKind::Daily | RecurrenceKind::Weekly => None,
        };
    }
}

/// Moves a recurring task to its next occurrence, or completes it when the
/// next occurrence would fall after the pattern's end date.
///
/// Non-recurring tasks are left untouched and yield `None`.
pub fn advance(task: &mut Task, tz: FixedOffset, now: DateTime<Utc>) -> Option<RecurrenceOutcome> {
    let pattern = task.recurrence.clone()?;
    let from = task.due_date;

    let next = next_due_date(&pattern, from, tz)
        .filter(|to| pattern.end_date.is_none_or(|end| *to <= end));
    let outcome = match next {
        Some(to) if task.advance_to(to).is_ok() => RecurrenceOutcome::Advanced { from, to },
        _ => {
            task.status = TaskStatus::Completed;
            task.apply_transitions(now);
            RecurrenceOutcome::Ended
        }
    };
    task.updated_at = now;
    Some(outcome)
}

/// Like [`advance`], then keeps advancing past occurrences whose reminder
/// would already be due at `now`, so a long-missed task fires once rather
/// than once per missed occurrence. Returns the outcome and how many
/// occurrences were skipped.
pub fn advance_past(
    task: &mut Task,
    tz: FixedOffset,
    now: DateTime<Utc>,
) -> Option<(RecurrenceOutcome, usize)> {
    let from = task.due_date;
    let mut outcome = advance(task, tz, now)?;
    let mut skipped = 0;

    while let RecurrenceOutcome::Advanced { .. } = outcome {
        let missed = task
            .reminder_trigger_at()
            .is_some_and(|trigger| trigger <= now);
        if !missed || skipped >= MAX_CATCH_UP {
            break;
        }
        skipped += 1;
        outcome = match advance(task, tz, now)? {
            RecurrenceOutcome::Advanced { to, .. } => RecurrenceOutcome::Advanced { from, to },
            RecurrenceOutcome::Ended => RecurrenceOutcome::Ended,
        };
    }
    Some((outcome, skipped))
}
