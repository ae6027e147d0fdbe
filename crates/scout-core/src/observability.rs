use serde::{Deserialize, Serialize};

use crate::domain::TaskStatus;

/// Task counts by status, plus pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
    /// Free worker slots.
    pub available_slots: usize,
}

impl SchedulerCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Timeout => self.timeout += 1,
        }
    }

    /// Queued + running.
    pub fn active(&self) -> usize {
        self.queued + self.running
    }

    pub fn total(&self) -> usize {
        self.active() + self.completed + self.failed + self.cancelled + self.timeout
    }
}
