mod common;

use chrono::{DateTime, Duration, FixedOffset, Utc};

use common::{at, harness};
use taskreminder::db::{notification_repository, settings_repository, task_repository};
use taskreminder::models::{
    DeliveryMethod, DeliveryTarget, NewNotification, NewTaskRequest, Notification,
    NotificationKind, Priority, RecurrenceKind, RecurrencePattern, Reminder, Task, TaskStatus,
    UpdateSettingsRequest, UpdateTaskRequest,
};
use taskreminder::services::recurrence;

fn reminded(title: &str, due: chrono::DateTime<chrono::Utc>, minutes: i64) -> NewTaskRequest {
    NewTaskRequest::new(title, due).with_reminder(Reminder::Offset { minutes })
}

#[tokio::test]
async fn test_nothing_fires_before_the_trigger_time() {
    let h = harness(at(15, 9, 0)).await;
    let task = h
        .state
        .tasks
        .create("alice", reminded("Dentist", at(15, 10, 0), 30))
        .await
        .unwrap();

    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.claimed, 0);
    assert!(h.gateway.sent().is_empty());

    h.clock.set(at(15, 9, 29));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);

    h.clock.set(at(15, 9, 30));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.delivered, 1);

    let notifications = notification_repository::list_for_task(&h.pool, &task.id).await.unwrap();
    assert_eq!(notifications.len(), 1);
    let n = &notifications[0];
    assert_eq!(n.kind, NotificationKind::Reminder);
    assert_eq!(n.owner, "alice");
    assert_eq!(n.title, "Task Reminder: Dentist");
    assert_eq!(n.scheduled_for, at(15, 9, 30));
    assert!(n.is_delivered);
    assert_eq!(n.delivered_at, Some(at(15, 9, 30)));
    assert_eq!(n.metadata["priority"], "medium");

    let sent = task_repository::fetch_reminders_sent(&h.pool, &task.id).await.unwrap();
    assert_eq!(sent, vec![at(15, 9, 30)]);

    // later ticks never fire the same occurrence again
    h.clock.set(at(15, 11, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);
    assert_eq!(h.gateway.sent().len(), 1);
}

#[tokio::test]
async fn test_concurrent_scans_fire_each_occurrence_once() {
    let h = harness(at(15, 8, 0)).await;
    let mut ids = Vec::new();
    for i in 0..6 {
        let task = h
            .state
            .tasks
            .create("alice", reminded(&format!("task {}", i), at(15, 9, i), 0))
            .await
            .unwrap();
        ids.push(task.id);
    }
    let recurring = h
        .state
        .tasks
        .create(
            "alice",
            reminded("daily", at(15, 9, 0), 0)
                .with_recurrence(RecurrencePattern::new(RecurrenceKind::Daily, 1)),
        )
        .await
        .unwrap();
    ids.push(recurring.id);

    h.clock.set(at(15, 10, 0));
    let (first, second) = tokio::join!(h.state.scanner.scan_once(), h.state.scanner.scan_once());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.claimed + second.claimed, 7);
    assert_eq!(h.gateway.sent().len(), 7);
    for id in &ids {
        let notifications = notification_repository::list_for_task(&h.pool, id).await.unwrap();
        assert_eq!(notifications.len(), 1, "task {} notified once", id);
    }
}

#[tokio::test]
async fn test_recurring_task_advances_when_its_reminder_fires() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create(
            "alice",
            reminded("Take vitamins", at(15, 9, 0), 10)
                .with_recurrence(RecurrencePattern::new(RecurrenceKind::Daily, 1)),
        )
        .await
        .unwrap();

    h.clock.set(at(15, 8, 50));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);

    let advanced = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(advanced.due_date, at(16, 9, 0));
    assert_eq!(advanced.status, TaskStatus::Pending);
    assert_eq!(advanced.reminders_sent, vec![at(15, 8, 50)]);
    assert_eq!(advanced.reminder_trigger_at(), Some(at(16, 8, 50)));

    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);

    h.clock.set(at(16, 8, 50));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);
    let advanced = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(advanced.due_date, at(17, 9, 0));
    assert_eq!(advanced.reminders_sent.len(), 2);
}

#[tokio::test]
async fn test_recurrence_past_its_end_date_completes_and_stops() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create(
            "alice",
            reminded("Weekly sync", at(15, 9, 0), 10).with_recurrence(
                RecurrencePattern::new(RecurrenceKind::Weekly, 1).with_end_date(at(20, 0, 0)),
            ),
        )
        .await
        .unwrap();

    h.clock.set(at(15, 8, 50));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);

    let done = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.completed_at, Some(at(15, 8, 50)));
    assert_eq!(done.due_date, at(15, 9, 0));

    h.clock.set(at(22, 9, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);
    let candidates = task_repository::fetch_reminder_candidates(&h.pool, at(22, 9, 0), 100)
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn test_one_failing_delivery_does_not_stop_the_others() {
    let h = harness(at(15, 8, 0)).await;
    h.gateway.fail_titles_containing("second");
    let mut ids = Vec::new();
    for title in ["first", "second", "third"] {
        let task = h
            .state
            .tasks
            .create("alice", reminded(title, at(15, 9, 0), 0))
            .await
            .unwrap();
        ids.push(task.id);
    }

    h.clock.set(at(15, 9, 0));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.claimed, 3);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.errors, 0);

    let failed = &notification_repository::list_for_task(&h.pool, &ids[1]).await.unwrap()[0];
    assert!(!failed.is_delivered);
    assert_eq!(failed.delivery_attempts, 1);
    assert_eq!(failed.last_error.as_deref(), Some("scripted failure"));
    assert_eq!(failed.next_attempt_at, Some(at(15, 9, 1)));
    assert!(!failed.delivery_failed);

    for id in [&ids[0], &ids[2]] {
        let n = &notification_repository::list_for_task(&h.pool, id).await.unwrap()[0];
        assert!(n.is_delivered);
    }
}

#[tokio::test]
async fn test_failed_delivery_is_retried_then_given_up() {
    let h = harness(at(15, 8, 0)).await;
    h.gateway.fail_everything(true);
    let task = h
        .state
        .tasks
        .create("alice", reminded("Renew passport", at(15, 9, 0), 0))
        .await
        .unwrap();

    h.clock.set(at(15, 9, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().failed, 1);

    // first retry one base delay later
    h.clock.set(at(15, 9, 0) + Duration::seconds(59));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().retried, 0);
    h.clock.set(at(15, 9, 1));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 1);

    let n = notification_repository::list_for_task(&h.pool, &task.id).await.unwrap().remove(0);
    assert_eq!(n.delivery_attempts, 2);
    assert_eq!(n.next_attempt_at, Some(at(15, 9, 3)));

    h.clock.set(at(15, 9, 3));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().retried, 1);

    let n = notification_repository::list_for_task(&h.pool, &task.id).await.unwrap().remove(0);
    assert_eq!(n.delivery_attempts, 3);
    assert!(n.delivery_failed);
    assert_eq!(n.next_attempt_at, None);
    assert!(!n.is_delivered);

    h.clock.set(at(15, 12, 0));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.retried, 0);
    assert_eq!(h.gateway.sent().len(), 3);
}

#[tokio::test]
async fn test_retry_succeeds_once_the_transport_recovers() {
    let h = harness(at(15, 8, 0)).await;
    h.gateway.fail_everything(true);
    let task = h
        .state
        .tasks
        .create("alice", reminded("Book flights", at(15, 9, 0), 0))
        .await
        .unwrap();

    h.clock.set(at(15, 9, 0));
    h.state.scanner.scan_once().await.unwrap();

    h.gateway.fail_everything(false);
    h.clock.set(at(15, 9, 5));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.delivered, 1);

    let n = notification_repository::list_for_task(&h.pool, &task.id).await.unwrap().remove(0);
    assert!(n.is_delivered);
    assert_eq!(n.delivered_at, Some(at(15, 9, 5)));
    assert_eq!(n.delivery_attempts, 2);
    assert_eq!(n.last_error, None);
}

#[tokio::test]
async fn test_notifications_stay_with_their_owner() {
    let h = harness(at(15, 8, 0)).await;
    h.state
        .tasks
        .create("alice", reminded("alice's task", at(15, 9, 0), 0))
        .await
        .unwrap();
    h.state
        .tasks
        .create("bob", reminded("bob's task", at(15, 9, 0), 0))
        .await
        .unwrap();

    h.clock.set(at(15, 9, 0));
    h.state.scanner.scan_once().await.unwrap();

    let alice = h.state.notifications.list("alice", false, None).await.unwrap();
    let bob = h.state.notifications.list("bob", false, None).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(bob.len(), 1);
    assert!(alice[0].title.contains("alice's task"));
    assert!(bob[0].title.contains("bob's task"));

    let messages = h.gateway.sent();
    assert!(messages
        .iter()
        .all(|m| m.target == DeliveryTarget::InApp(m.owner.clone())));
}

#[tokio::test]
async fn test_push_goes_to_the_latest_registered_device() {
    let h = harness(at(15, 8, 0)).await;
    h.gateway.enable_push();
    settings_repository::add_device_token(&h.pool, "alice", "old-phone", at(1, 0, 0))
        .await
        .unwrap();
    settings_repository::add_device_token(&h.pool, "alice", "new-phone", at(2, 0, 0))
        .await
        .unwrap();
    h.state
        .tasks
        .create("alice", reminded("Gym", at(15, 9, 0), 0))
        .await
        .unwrap();
    h.state
        .tasks
        .create("bob", reminded("Gym", at(15, 9, 0), 0))
        .await
        .unwrap();

    h.clock.set(at(15, 9, 0));
    h.state.scanner.scan_once().await.unwrap();

    let sent = h.gateway.sent();
    let alice = sent.iter().find(|m| m.owner == "alice").unwrap();
    assert_eq!(alice.method, DeliveryMethod::Push);
    assert_eq!(alice.target, DeliveryTarget::Device("new-phone".to_string()));
    let bob = sent.iter().find(|m| m.owner == "bob").unwrap();
    assert_eq!(bob.method, DeliveryMethod::InApp);
}

#[tokio::test]
async fn test_completed_cancelled_and_archived_tasks_are_skipped() {
    let h = harness(at(15, 8, 0)).await;
    let done = h
        .state
        .tasks
        .create("alice", reminded("done", at(15, 9, 0), 0))
        .await
        .unwrap();
    h.state.tasks.complete("alice", &done.id).await.unwrap();

    let cancelled = h
        .state
        .tasks
        .create("alice", reminded("cancelled", at(15, 9, 0), 0))
        .await
        .unwrap();
    let update = UpdateTaskRequest {
        status: Some(TaskStatus::Cancelled),
        ..Default::default()
    };
    h.state.tasks.update("alice", &cancelled.id, update).await.unwrap();

    let archived = h
        .state
        .tasks
        .create("alice", reminded("archived", at(15, 9, 0), 0))
        .await
        .unwrap();
    h.state.tasks.archive("alice", &archived.id, true).await.unwrap();

    h.clock.set(at(15, 10, 0));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.claimed, 0);
    assert!(h.gateway.sent().is_empty());
}

#[tokio::test]
async fn test_rescheduling_a_fired_task_arms_a_new_occurrence() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create("alice", reminded("Haircut", at(15, 9, 0), 0))
        .await
        .unwrap();

    h.clock.set(at(15, 9, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);

    let update = UpdateTaskRequest {
        due_date: Some(at(16, 9, 0)),
        ..Default::default()
    };
    h.state.tasks.update("alice", &task.id, update).await.unwrap();
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);

    h.clock.set(at(16, 9, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);
    let sent = task_repository::fetch_reminders_sent(&h.pool, &task.id).await.unwrap();
    assert_eq!(sent, vec![at(15, 9, 0), at(16, 9, 0)]);
}

#[tokio::test]
async fn test_deleting_a_task_removes_its_notifications() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create("alice", reminded("Groceries", at(15, 9, 0), 0))
        .await
        .unwrap();
    h.clock.set(at(15, 9, 0));
    h.state.scanner.scan_once().await.unwrap();
    h.state.notifications.send_test("alice").await.unwrap();
    assert_eq!(h.state.notifications.unread_count("alice").await.unwrap(), 2);

    h.state.tasks.delete("alice", &task.id).await.unwrap();

    assert!(notification_repository::list_for_task(&h.pool, &task.id).await.unwrap().is_empty());
    assert!(task_repository::fetch_reminders_sent(&h.pool, &task.id).await.unwrap().is_empty());
    let remaining = h.state.notifications.list("alice", false, None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, NotificationKind::Test);
}

fn reminder_for(task: &Task, trigger_at: DateTime<Utc>, now: DateTime<Utc>) -> Notification {
    NewNotification {
        owner: task.owner.clone(),
        task_id: Some(task.id.clone()),
        kind: NotificationKind::Reminder,
        title: format!("Task Reminder: {}", task.title),
        message: format!("{} is due", task.title),
        delivery_method: DeliveryMethod::InApp,
        scheduled_for: trigger_at,
        metadata: serde_json::Map::new(),
    }
    .into_notification(now)
}

#[tokio::test]
async fn test_an_edit_between_scan_and_claim_is_kept() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create(
            "alice",
            reminded("Water plants", at(15, 9, 0), 10)
                .with_recurrence(RecurrencePattern::new(RecurrenceKind::Daily, 1)),
        )
        .await
        .unwrap();

    let now = at(15, 8, 50);
    h.clock.set(now);
    let snapshot = task_repository::fetch_reminder_candidates(&h.pool, now, 10)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(snapshot.id, task.id);

    // the owner edits the task after the scan read it
    let edit = UpdateTaskRequest {
        title: Some("Water the ferns".to_string()),
        priority: Some(Priority::High),
        ..Default::default()
    };
    h.state.tasks.update("alice", &task.id, edit).await.unwrap();

    let trigger_at = snapshot.reminder_due(now).unwrap();
    let mut advanced = snapshot.clone();
    recurrence::advance(&mut advanced, FixedOffset::east_opt(0).unwrap(), now);
    let notification = reminder_for(&snapshot, trigger_at, now);
    let claimed = task_repository::claim_reminder_occurrence(
        &h.pool,
        &snapshot,
        trigger_at,
        &notification,
        Some(&advanced),
        now,
    )
    .await
    .unwrap();
    assert!(!claimed);

    let current = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(current.title, "Water the ferns");
    assert_eq!(current.priority, Priority::High);
    assert_eq!(current.due_date, at(15, 9, 0));
    assert!(notification_repository::list_for_task(&h.pool, &task.id).await.unwrap().is_empty());

    // the next scan reads the edited task and fires from it
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);
    let current = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(current.title, "Water the ferns");
    assert_eq!(current.priority, Priority::High);
    assert_eq!(current.due_date, at(16, 9, 0));
    assert_eq!(h.gateway.sent()[0].title, "Task Reminder: Water the ferns");
}

#[tokio::test]
async fn test_an_attempt_that_never_reports_back_is_retried_after_its_lease() {
    let h = harness(at(15, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create("alice", reminded("Call the bank", at(15, 9, 0), 0))
        .await
        .unwrap();

    // claimed and committed, then the process died before delivering
    let now = at(15, 9, 0);
    h.clock.set(now);
    let snapshot = h.state.tasks.get("alice", &task.id).await.unwrap();
    let mut notification = reminder_for(&snapshot, now, now);
    notification.start_attempt(now + Duration::minutes(5));
    assert!(
        task_repository::claim_reminder_occurrence(&h.pool, &snapshot, now, &notification, None, now)
            .await
            .unwrap()
    );

    h.clock.set(at(15, 9, 4));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!((stats.claimed, stats.retried), (0, 0));
    assert!(h.gateway.sent().is_empty());

    h.clock.set(at(15, 9, 5));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.delivered, 1);

    let n = notification_repository::find_notification(&h.pool, &notification.id)
        .await
        .unwrap()
        .unwrap();
    assert!(n.is_delivered);
    assert_eq!(n.delivery_attempts, 2);
    assert_eq!(n.next_attempt_at, None);
}

#[tokio::test]
async fn test_an_interrupted_final_attempt_gives_up() {
    let h = harness(at(15, 9, 0)).await;
    let mut notification = NewNotification {
        owner: "alice".to_string(),
        task_id: None,
        kind: NotificationKind::Test,
        title: "Test Notification".to_string(),
        message: "stuck".to_string(),
        delivery_method: DeliveryMethod::InApp,
        scheduled_for: at(15, 9, 0),
        metadata: serde_json::Map::new(),
    }
    .into_notification(at(15, 9, 0));
    for _ in 0..3 {
        notification.start_attempt(at(15, 9, 5));
    }
    notification_repository::insert_notification(&h.pool, &notification).await.unwrap();

    h.clock.set(at(15, 9, 5));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 1);
    assert!(h.gateway.sent().is_empty());

    let n = notification_repository::find_notification(&h.pool, &notification.id)
        .await
        .unwrap()
        .unwrap();
    assert!(n.delivery_failed);
    assert_eq!(n.next_attempt_at, None);

    h.clock.set(at(15, 12, 0));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().retried, 0);
}

#[tokio::test]
async fn test_a_long_missed_recurring_task_fires_once_and_catches_up() {
    let h = harness(at(1, 8, 0)).await;
    let task = h
        .state
        .tasks
        .create(
            "alice",
            reminded("Journal", at(1, 9, 0), 10)
                .with_recurrence(RecurrencePattern::new(RecurrenceKind::Daily, 1)),
        )
        .await
        .unwrap();

    h.clock.set(at(15, 8, 0));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.claimed, 1);

    let current = h.state.tasks.get("alice", &task.id).await.unwrap();
    assert_eq!(current.due_date, at(15, 9, 0));
    assert_eq!(current.status, TaskStatus::Pending);

    let notifications = notification_repository::list_for_task(&h.pool, &task.id).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].metadata["skippedOccurrences"], 13);

    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 0);
    assert_eq!(h.gateway.sent().len(), 1);

    h.clock.set(at(15, 8, 50));
    assert_eq!(h.state.scanner.scan_once().await.unwrap().claimed, 1);
}

#[tokio::test]
async fn test_email_is_used_when_enabled_and_push_is_not_usable() {
    let h = harness(at(15, 8, 0)).await;
    h.gateway.enable_email();
    let enable = UpdateSettingsRequest {
        email_enabled: Some(true),
        email: Some("alice@example.com".to_string()),
        ..Default::default()
    };
    h.state.notifications.update_settings("alice", enable).await.unwrap();
    for owner in ["alice", "bob"] {
        h.state
            .tasks
            .create(owner, reminded("Pay rent", at(15, 9, 0), 0))
            .await
            .unwrap();
    }

    h.clock.set(at(15, 9, 0));
    let stats = h.state.scanner.scan_once().await.unwrap();
    assert_eq!(stats.delivered, 2);

    let sent = h.gateway.sent();
    let alice = sent.iter().find(|m| m.owner == "alice").unwrap();
    assert_eq!(alice.method, DeliveryMethod::Email);
    assert_eq!(alice.target, DeliveryTarget::Email("alice@example.com".to_string()));
    let bob = sent.iter().find(|m| m.owner == "bob").unwrap();
    assert_eq!(bob.method, DeliveryMethod::InApp);
}
