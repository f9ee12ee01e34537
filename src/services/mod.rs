pub mod dispatch;
pub mod notification_service;
pub mod recurrence;
pub mod scanner;
pub mod scheduler;
pub mod settings;
pub mod task_service;

pub use dispatch::Dispatcher;
pub use notification_service::{NotificationService, TestSendResult};
pub use scanner::{ReminderScanner, ScanStats};
pub use scheduler::{ReminderScheduler, SchedulerHandle};
pub use settings::{SqliteSettingsProvider, UserSettingsProvider};
pub use task_service::TaskService;
