//! Admission queue for tasks waiting on a slot.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::{Priority, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pending {
    task_id: TaskId,
    enqueued_at: Instant,
    /// Once a lower-tier task has waited this long it jumps the tiers above it.
    budget: Duration,
}

impl Pending {
    fn overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued_at) > self.budget
    }
}

/// Tiered FIFO queue.
///
/// - FIFO within a tier; High drains before Normal before Low.
/// - Aging: a Normal/Low head that has waited longer than its own time budget is
///   picked first (oldest overdue head first), so lower tiers never starve.
/// - Holds ids only; the record is the source of truth for status.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tiers: [VecDeque<Pending>; 3],
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: Priority, budget: Duration, now: Instant) {
        self.tiers[priority.index()].push_back(Pending {
            task_id,
            enqueued_at: now,
            budget,
        });
    }

    pub fn pop(&mut self, now: Instant) -> Option<TaskId> {
        let aged = Priority::ALL
            .iter()
            .skip(1)
            .filter_map(|p| {
                let head = self.tiers[p.index()].front()?;
                head.overdue(now).then_some((head.enqueued_at, p.index()))
            })
            .min();

        let tier = match aged {
            Some((_, tier)) => tier,
            None => self.tiers.iter().position(|t| !t.is_empty())?,
        };
        self.tiers[tier].pop_front().map(|p| p.task_id)
    }

    /// Drop a queued task. Returns false when it is not (or no longer) queued.
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        for tier in &mut self.tiers {
            if let Some(pos) = tier.iter().position(|p| p.task_id == task_id) {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn drain(&mut self) -> Vec<TaskId> {
        self.tiers
            .iter_mut()
            .flat_map(|t| t.drain(..))
            .map(|p| p.task_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }
}
