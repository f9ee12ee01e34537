use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::services::scanner::ReminderScanner;

/// Runs the reminder scanner on a fixed interval until cancelled.
pub struct ReminderScheduler {
    scanner: Arc<ReminderScanner>,
    interval: Duration,
}

/// Owner of a running scheduler loop.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ReminderScheduler {
    pub fn new(scanner: Arc<ReminderScanner>, interval: Duration) -> Self {
        Self { scanner, interval }
    }

    /// Spawns the loop onto the runtime; cancelling `cancel` (or calling
    /// [`SchedulerHandle::shutdown`]) stops it between ticks.
    pub fn spawn(
        scanner: Arc<ReminderScanner>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> SchedulerHandle {
        let scheduler = Self::new(scanner, interval);
        let token = cancel.clone();
        let handle = tokio::spawn(scheduler.start(token));
        SchedulerHandle { cancel, handle }
    }

    /// Ticks run one after another, never overlapping. A tick that takes
    /// longer than the interval swallows the ticks it missed.
    pub async fn start(self, cancel: CancellationToken) {
        info!("Starting reminder scheduler (interval: {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reminder scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scanner.scan_once().await {
                        // the next tick tries again
                        warn!("Reminder scan failed: {:?}", e);
                    }
                }
            }
        }
    }
}

impl SchedulerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the loop and waits for an in-flight tick to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Reminder scheduler task ended abnormally: {}", e);
        }
    }
}
