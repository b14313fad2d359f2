//! Persisted rows of the queue: `task` and `scheduled_task`.

pub mod scheduled_task;
pub mod task;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use scheduled_task::ScheduledTask;
pub use task::{Task, TaskOutcome};

/// Task arguments. Always a JSON object, never a bare scalar or array.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[sqlx(transparent)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Identifier of a `task` row, assigned by the store.
    TaskId
);
row_id!(
    /// Identifier of a `scheduled_task` row, assigned by the store.
    ScheduleId
);
