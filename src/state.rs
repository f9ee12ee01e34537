use std::sync::Arc;

use chrono::FixedOffset;
use sqlx::SqlitePool;

use crate::clock::SharedClock;
use crate::config::ScanConfig;
use crate::delivery::DeliveryGateway;
use crate::services::{
    Dispatcher, NotificationService, ReminderScanner, SqliteSettingsProvider, TaskService,
};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub tasks: TaskService,
    pub notifications: NotificationService,
    pub scanner: Arc<ReminderScanner>,
}

impl AppState {
    /// Wires every service over one pool, gateway and clock.
    pub fn new(
        db: SqlitePool,
        gateway: Arc<dyn DeliveryGateway>,
        clock: SharedClock,
        scan: &ScanConfig,
        day_boundary: FixedOffset,
    ) -> Self {
        let settings = Arc::new(SqliteSettingsProvider::new(db.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            gateway,
            settings,
            clock.clone(),
            scan.retry,
        ));
        let scanner = Arc::new(ReminderScanner::new(
            db.clone(),
            dispatcher.clone(),
            clock.clone(),
            day_boundary,
            scan,
        ));

        Self {
            tasks: TaskService::new(db.clone(), clock.clone(), day_boundary),
            notifications: NotificationService::new(db.clone(), dispatcher, clock),
            scanner,
            db,
        }
    }
}
