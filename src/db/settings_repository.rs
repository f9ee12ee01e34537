use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::to_millis;
use crate::error::AppError;
use crate::models::{UpdateSettingsRequest, UserSettings};

pub async fn get_settings(db: &SqlitePool, owner: &str) -> Result<UserSettings, AppError> {
    let row: Option<(bool, bool, Option<String>)> = sqlx::query_as(
        "SELECT push_enabled, email_enabled, email FROM user_settings WHERE owner = ?1",
    )
    .bind(owner)
    .fetch_optional(db)
    .await?;

    let mut settings = UserSettings::defaults_for(owner);
    if let Some((push_enabled, email_enabled, email)) = row {
        settings.push_enabled = push_enabled;
        settings.email_enabled = email_enabled;
        settings.email = email;
    }
    settings.device_tokens = sqlx::query_scalar(
        "SELECT token FROM device_tokens WHERE owner = ?1 ORDER BY created_at ASC, token ASC",
    )
    .bind(owner)
    .fetch_all(db)
    .await?;

    Ok(settings)
}

pub async fn update_settings(
    db: &SqlitePool,
    owner: &str,
    req: UpdateSettingsRequest,
    now: DateTime<Utc>,
) -> Result<UserSettings, AppError> {
    let mut current = get_settings(db, owner).await?;
    if let Some(push_enabled) = req.push_enabled {
        current.push_enabled = push_enabled;
    }
    if let Some(email_enabled) = req.email_enabled {
        current.email_enabled = email_enabled;
    }
    if let Some(email) = req.email {
        current.email = Some(email);
    }

    sqlx::query(
        r#"
        INSERT INTO user_settings (owner, push_enabled, email_enabled, email, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(owner) DO UPDATE SET
            push_enabled = excluded.push_enabled,
            email_enabled = excluded.email_enabled,
            email = excluded.email,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(owner)
    .bind(current.push_enabled)
    .bind(current.email_enabled)
    .bind(&current.email)
    .bind(to_millis(now))
    .execute(db)
    .await?;

    Ok(current)
}

pub async fn add_device_token(
    db: &SqlitePool,
    owner: &str,
    token: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if token.trim().is_empty() {
        return Err(AppError::validation("FCM token is required"));
    }
    sqlx::query(
        r#"
        INSERT INTO device_tokens (owner, token, created_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(owner, token) DO UPDATE SET created_at = excluded.created_at
        "#,
    )
    .bind(owner)
    .bind(token)
    .bind(to_millis(now))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn remove_device_token(db: &SqlitePool, owner: &str, token: &str) -> Result<bool, AppError> {
    let affected = sqlx::query("DELETE FROM device_tokens WHERE owner = ?1 AND token = ?2")
        .bind(owner)
        .bind(token)
        .execute(db)
        .await?
        .rows_affected();
    Ok(affected > 0)
}
