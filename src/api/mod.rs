use axum::Json;
use axum::extract::{FromRequestParts, Path, Query};
use axum::http::request::Parts;
use axum::routing::{delete, patch, post, put};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::*;
use crate::services::{ScanStats, TestSendResult};
use crate::state::AppState;

/// Caller identity, set by the authenticating proxy in front of us.
pub const USER_HEADER: &str = "x-user-id";

pub struct Owner(pub String);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .map(|owner| Owner(owner.to_string()))
            .ok_or(AppError::Forbidden)
    }
}

#[derive(Deserialize)]
struct NotificationQueryParams {
    #[serde(default)]
    unread_only: bool,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SubtaskUpdate {
    completed: bool,
}

#[derive(Deserialize)]
struct ArchiveUpdate {
    #[serde(default = "default_true")]
    archived: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct DeviceTokenRequest {
    token: String,
}

#[derive(Serialize)]
struct CountResponse {
    count: u64,
}

#[derive(Serialize)]
struct UnreadCountResponse {
    unread_count: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/overdue", get(overdue_tasks))
        .route("/tasks/due-today", get(due_today))
        .route("/tasks/due-this-week", get(due_this_week))
        .route("/tasks/{id}", get(get_task).patch(update_task).delete(delete_task))
        .route("/tasks/{id}/complete", put(complete_task))
        .route("/tasks/{id}/incomplete", put(incomplete_task))
        .route("/tasks/{id}/toggle", put(toggle_task))
        .route("/tasks/{id}/archive", put(archive_task))
        .route("/tasks/{id}/subtasks/{index}", patch(update_subtask))
        .route("/notifications", get(list_notifications))
        .route("/notifications/clear-all", delete(clear_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", put(mark_all_read))
        .route("/notifications/test", post(send_test))
        .route("/notifications/settings", get(get_settings).put(update_settings))
        .route(
            "/notifications/device-tokens",
            post(register_device_token).delete(remove_device_token),
        )
        .route("/notifications/{id}/read", put(mark_read))
        .route("/notifications/{id}", delete(delete_notification))
        .route("/reminders/scan", post(scan_now))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    sqlx::query("select 1").execute(&state.db).await?;
    Ok(StatusCode::OK)
}

async fn list_tasks(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.tasks.list(&owner, &filter).await?))
}

async fn create_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<NewTaskRequest>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state.tasks.create(&owner, req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.get(&owner, &id).await?))
}

async fn update_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.update(&owner, &id, req).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.tasks.delete(&owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.complete(&owner, &id).await?))
}

async fn incomplete_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.incomplete(&owner, &id).await?))
}

async fn toggle_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.toggle_complete(&owner, &id).await?))
}

async fn archive_task(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    Json(req): Json<ArchiveUpdate>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.tasks.archive(&owner, &id, req.archived).await?))
}

async fn update_subtask(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path((id, index)): Path<(String, usize)>,
    Json(req): Json<SubtaskUpdate>,
) -> Result<Json<Task>, AppError> {
    let task = state
        .tasks
        .set_subtask_completed(&owner, &id, index, req.completed)
        .await?;
    Ok(Json(task))
}

async fn task_stats(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<TaskStats>, AppError> {
    Ok(Json(state.tasks.stats(&owner).await?))
}

async fn overdue_tasks(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.tasks.overdue(&owner).await?))
}

async fn due_today(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.tasks.due_today(&owner).await?))
}

async fn due_this_week(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.tasks.due_this_week(&owner).await?))
}

async fn list_notifications(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(params): Query<NotificationQueryParams>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let notifications = state
        .notifications
        .list(&owner, params.unread_only, params.limit)
        .await?;
    Ok(Json(notifications))
}

async fn unread_count(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<UnreadCountResponse>, AppError> {
    let unread_count = state.notifications.unread_count(&owner).await?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn mark_read(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(state.notifications.mark_read(&owner, &id).await?))
}

async fn mark_all_read(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<CountResponse>, AppError> {
    let count = state.notifications.mark_all_read(&owner).await?;
    Ok(Json(CountResponse { count }))
}

async fn delete_notification(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.notifications.delete(&owner, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_notifications(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<CountResponse>, AppError> {
    let count = state.notifications.clear_all(&owner).await?;
    Ok(Json(CountResponse { count }))
}

async fn send_test(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<TestSendResult>, AppError> {
    Ok(Json(state.notifications.send_test(&owner).await?))
}

async fn get_settings(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Json<UserSettings>, AppError> {
    Ok(Json(state.notifications.settings(&owner).await?))
}

async fn update_settings(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<UserSettings>, AppError> {
    Ok(Json(state.notifications.update_settings(&owner, req).await?))
}

async fn register_device_token(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<DeviceTokenRequest>,
) -> Result<Json<UserSettings>, AppError> {
    let settings = state
        .notifications
        .register_device_token(&owner, &req.token)
        .await?;
    Ok(Json(settings))
}

async fn remove_device_token(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<DeviceTokenRequest>,
) -> Result<Json<UserSettings>, AppError> {
    let settings = state
        .notifications
        .remove_device_token(&owner, &req.token)
        .await?;
    Ok(Json(settings))
}

async fn scan_now(State(state): State<AppState>) -> Result<Json<ScanStats>, AppError> {
    let stats = state.scanner.scan_once().await?;
    Ok(Json(stats))
}
