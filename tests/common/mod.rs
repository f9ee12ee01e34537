#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use sqlx::SqlitePool;

use taskreminder::clock::ManualClock;
use taskreminder::config::{RetryPolicy, ScanConfig};
use taskreminder::db;
use taskreminder::delivery::{DeliveryGateway, DeliveryMessage, DeliveryOutcome};
use taskreminder::models::DeliveryMethod;
use taskreminder::state::AppState;

/// Gateway that records every message and fails the ones it is told to.
#[derive(Default)]
pub struct ScriptedGateway {
    sent: Mutex<Vec<DeliveryMessage>>,
    failing_titles: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    push: AtomicBool,
    email: AtomicBool,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every message whose title contains `needle`.
    pub fn fail_titles_containing(&self, needle: &str) {
        self.failing_titles.lock().unwrap().insert(needle.to_string());
    }

    pub fn fail_everything(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn enable_push(&self) {
        self.push.store(true, Ordering::SeqCst);
    }

    pub fn enable_email(&self) {
        self.email.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<DeliveryMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryGateway for ScriptedGateway {
    async fn deliver(&self, message: &DeliveryMessage) -> DeliveryOutcome {
        self.sent.lock().unwrap().push(message.clone());

        let scripted_failure = self
            .failing_titles
            .lock()
            .unwrap()
            .iter()
            .any(|needle| message.title.contains(needle.as_str()));
        if self.fail_all.load(Ordering::SeqCst) || scripted_failure {
            return DeliveryOutcome::Failed("scripted failure".to_string());
        }
        DeliveryOutcome::Delivered
    }

    fn supports(&self, method: DeliveryMethod) -> bool {
        match method {
            DeliveryMethod::InApp => true,
            DeliveryMethod::Push => self.push.load(Ordering::SeqCst),
            DeliveryMethod::Email => self.email.load(Ordering::SeqCst),
            DeliveryMethod::Sms => false,
        }
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<ScriptedGateway>,
    pub state: AppState,
}

pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, day, hour, minute, 0).unwrap()
}

pub fn scan_config() -> ScanConfig {
    ScanConfig {
        interval: std::time::Duration::from_millis(20),
        concurrency: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::seconds(60),
            lease: Duration::minutes(5),
        },
    }
}

pub async fn harness(now: DateTime<Utc>) -> Harness {
    let pool = db::connect_in_memory().await.expect("in-memory database");
    let clock = Arc::new(ManualClock::new(now));
    let gateway = Arc::new(ScriptedGateway::new());
    let state = AppState::new(
        pool.clone(),
        gateway.clone(),
        clock.clone(),
        &scan_config(),
        FixedOffset::east_opt(0).unwrap(),
    );

    Harness {
        pool,
        clock,
        gateway,
        state,
    }
}
