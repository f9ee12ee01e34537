use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub scan: ScanConfig,
    /// Offset used for calendar-day boundaries ("due today", weekly recurrence).
    pub day_boundary: FixedOffset,
    pub push: Option<PushConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub interval: Duration,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: chrono::Duration,
    /// How long an attempt in flight keeps its row; an attempt that never
    /// reports back is retried after this.
    pub lease: chrono::Duration,
}

#[derive(Clone, Debug)]
pub struct PushConfig {
    pub endpoint: String,
    pub access_token: String,
}

#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    /// Sender mailbox, `Name <address>` or a bare address.
    pub from: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: chrono::Duration::seconds(60),
            lease: chrono::Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempts` deliveries have failed,
    /// or `None` when the notification has run out of attempts.
    pub fn next_delay(&self, attempts: u32) -> Option<chrono::Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(16);
        Some(self.base_delay * 2_i32.pow(exponent))
    }
}

impl Config {
    pub fn new_from_env() -> Result<Self, AppError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://taskreminder.db".to_string());
        let bind_addr = parse_var("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?;

        let interval_secs: u64 = parse_var("SCAN_INTERVAL_SECS", 60)?;
        if interval_secs == 0 {
            return Err(AppError::Config("SCAN_INTERVAL_SECS must be positive".to_string()));
        }
        let concurrency: usize = parse_var("SCAN_CONCURRENCY", 8)?;
        if concurrency == 0 {
            return Err(AppError::Config("SCAN_CONCURRENCY must be positive".to_string()));
        }
        let max_attempts: u32 = parse_var("DELIVERY_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(AppError::Config("DELIVERY_MAX_ATTEMPTS must be positive".to_string()));
        }
        let retry_base_secs: i64 = parse_var("DELIVERY_RETRY_BASE_SECS", 60)?;
        let lease_secs: i64 = parse_var("DELIVERY_LEASE_SECS", 300)?;
        if lease_secs <= 0 {
            return Err(AppError::Config("DELIVERY_LEASE_SECS must be positive".to_string()));
        }

        let offset_minutes: i32 = parse_var("DAY_BOUNDARY_OFFSET_MINUTES", 0)?;
        let day_boundary = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            AppError::Config(format!(
                "DAY_BOUNDARY_OFFSET_MINUTES out of range: {}",
                offset_minutes
            ))
        })?;

        let push = match (env::var("FCM_ENDPOINT"), env::var("FCM_ACCESS_TOKEN")) {
            (Ok(endpoint), Ok(access_token)) => Some(PushConfig { endpoint, access_token }),
            _ => None,
        };

        let email = match (
            env::var("SMTP_HOST"),
            env::var("SMTP_USER"),
            env::var("SMTP_PASS"),
            env::var("FROM_EMAIL"),
        ) {
            (Ok(smtp_host), Ok(username), Ok(password), Ok(address)) => Some(EmailConfig {
                smtp_host,
                smtp_port: parse_var("SMTP_PORT", 587)?,
                username,
                password,
                from: match env::var("FROM_NAME") {
                    Ok(name) => format!("{} <{}>", name, address),
                    Err(_) => address,
                },
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            bind_addr,
            scan: ScanConfig {
                interval: Duration::from_secs(interval_secs),
                concurrency,
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: chrono::Duration::seconds(retry_base_secs),
                    lease: chrono::Duration::seconds(lease_secs),
                },
            },
            day_boundary,
            push,
            email,
        })
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::Config(format!("{} is invalid ({}): {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
