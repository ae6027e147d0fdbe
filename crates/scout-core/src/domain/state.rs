//! Task lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a research task.
///
/// State transitions:
/// - Queued -> Running -> Completed
/// - Queued -> Running -> Failed
/// - Queued -> Running -> Cancelled
/// - Queued -> Running -> Timeout
/// - Queued -> Cancelled (cancelled before a slot was free)
///
/// The four right-hand states are terminal: once reached, the status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a concurrency slot.
    Queued,

    /// Occupying a worker slot; the task body is executing.
    Running,

    /// Task body returned a result in time.
    Completed,

    /// Task body returned an unrecoverable error.
    Failed,

    /// Cancelled by request.
    Cancelled,

    /// Running time exceeded the task's time budget.
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Is `self -> next` a legal transition?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Queued => matches!(next, TaskStatus::Running | TaskStatus::Cancelled),
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
