pub mod notification;
pub mod settings;
pub mod task;

pub use notification::{DeliveryMethod, NewNotification, Notification, NotificationKind};
pub use settings::{DeliveryTarget, UpdateSettingsRequest, UserSettings};
pub use task::{
    Category, NewSubtask, NewTaskRequest, Priority, RecurrenceKind, RecurrencePattern, Reminder,
    Subtask, Task, TaskFilter, TaskStats, TaskStatus, UpdateTaskRequest,
};

/// Enums stored as TEXT columns. The column value is the same string serde
/// uses on the wire.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::error::AppError::validation(format!(
                        "invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;
