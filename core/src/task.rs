//! Durable scheduled tasks.
//!
//! One-shot delayed actions are rows in a table instead of in-process
//! timers, so a restart never loses a pending timeout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of scheduled work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Cancel the subject payment if it is still pending
    PaymentTimeout,
}

impl TaskKind {
    /// Convert kind to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentTimeout => "payment_timeout",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment_timeout" => Ok(Self::PaymentTimeout),
            other => Err(format!("Invalid task kind: {other}")),
        }
    }
}

/// A claimed, not yet completed task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledTask {
    /// Row identity
    pub id: i64,
    /// What to do
    pub kind: TaskKind,
    /// Entity the task acts on (a payment id for [`TaskKind::PaymentTimeout`])
    pub subject_id: Uuid,
    /// Earliest instant the task may run
    pub due_at: DateTime<Utc>,
    /// Failed executions so far
    pub attempts: u32,
}
