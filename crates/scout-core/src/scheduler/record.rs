//! Task record: inputs + lifecycle state + timeline.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, watch};

use crate::domain::{ResearchParams, ResearchResult, TaskEvent, TaskEventKind, TaskId, TaskStatus};

/// The unit of work tracked by the scheduler.
///
/// Design:
/// - Single source of truth for one task; the queue only holds ids.
/// - Writers are the scheduler and the task's own context. Everyone else reads
///   through [`TaskRecord::snapshot`].
/// - All state transitions go through `transition`, which refuses to leave a
///   terminal state.
#[derive(Debug)]
pub struct TaskRecord {
    id: TaskId,
    question: String,
    params: ResearchParams,
    created_at: DateTime<Utc>,
    state: RwLock<RecordState>,
    /// Held from `append_event` until the event is handed to the broadcaster.
    stream: AsyncMutex<()>,
    finished: watch::Sender<bool>,
}

#[derive(Debug)]
struct RecordState {
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<ResearchResult>,
    error: Option<String>,
    cancel_reason: Option<String>,
    pages_visited: u32,
    timeline: Vec<TaskEvent>,
    /// Set once the scheduler has appended the closing events.
    sealed: bool,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        question: String,
        params: ResearchParams,
        created_at: DateTime<Utc>,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id,
            question,
            params,
            created_at,
            state: RwLock::new(RecordState {
                status: TaskStatus::Queued,
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
                cancel_reason: None,
                pages_visited: 0,
                timeline: Vec::new(),
                sealed: false,
            }),
            stream: AsyncMutex::new(()),
            finished,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn params(&self) -> &ResearchParams {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().started_at
    }

    pub fn pages_visited(&self) -> u32 {
        self.state.read().pages_visited
    }

    /// Move to `next` if the state machine allows it. Returns false otherwise.
    pub fn transition(&self, next: TaskStatus, at: DateTime<Utc>) -> bool {
        let mut state = self.state.write();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next == TaskStatus::Running {
            state.started_at = Some(at);
        }
        if next.is_terminal() {
            state.finished_at = Some(at);
        }
        true
    }

    /// Enter a terminal state together with its result and error detail.
    ///
    /// `result` replaces any partial recorded earlier only when it is `Some`.
    pub fn finish(
        &self,
        status: TaskStatus,
        result: Option<ResearchResult>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.write();
        if !state.status.can_transition_to(status) {
            return false;
        }
        state.status = status;
        state.finished_at = Some(at);
        if result.is_some() {
            state.result = result;
        }
        state.error = error;
        true
    }

    /// Keep the best answer so far. Ignored once the task is terminal.
    pub fn record_partial(&self, mut result: ResearchResult) {
        let mut state = self.state.write();
        if state.status.is_terminal() {
            return;
        }
        result.partial = true;
        state.result = Some(result);
    }

    pub fn partial_result(&self) -> Option<ResearchResult> {
        self.state.read().result.clone()
    }

    pub fn set_cancel_reason(&self, reason: impl Into<String>) {
        let mut state = self.state.write();
        if state.cancel_reason.is_none() {
            state.cancel_reason = Some(reason.into());
        }
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.state.read().cancel_reason.clone()
    }

    pub fn increment_pages(&self) -> u32 {
        let mut state = self.state.write();
        state.pages_visited += 1;
        state.pages_visited
    }

    /// Serializes append-then-stream, so the stream carries events in `seq` order
    /// even when several clones of a task context emit at once.
    pub(crate) async fn lock_stream(&self) -> AsyncMutexGuard<'_, ()> {
        self.stream.lock().await
    }

    /// Append a progress event. Refused (`None`) once the task is terminal.
    pub fn append_event(&self, kind: TaskEventKind, at: DateTime<Utc>) -> Option<TaskEvent> {
        let mut state = self.state.write();
        if state.status.is_terminal() || state.sealed {
            return None;
        }
        Some(state.push(self.id, self.created_at, kind, at))
    }

    /// Append the closing events of a terminal task. Only the first call has an
    /// effect; it also wakes everyone waiting in [`TaskRecord::wait_finished`].
    pub fn seal(&self, kinds: Vec<TaskEventKind>, at: DateTime<Utc>) -> Vec<TaskEvent> {
        let events = {
            let mut state = self.state.write();
            if state.sealed || !state.status.is_terminal() {
                return Vec::new();
            }
            state.sealed = true;
            kinds
                .into_iter()
                .map(|kind| state.push(self.id, self.created_at, kind, at))
                .collect()
        };
        self.finished.send_replace(true);
        events
    }

    pub fn is_sealed(&self) -> bool {
        self.state.read().sealed
    }

    /// Resolves once the record is terminal and sealed.
    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives as long as the record
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn timeline(&self) -> Vec<TaskEvent> {
        self.state.read().timeline.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            id: self.id,
            question: self.question.clone(),
            params: self.params.clone(),
            status: state.status,
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            result: state.result.clone(),
            error: state.error.clone(),
            pages_visited: state.pages_visited,
            events: state.timeline.clone(),
        }
    }
}

impl RecordState {
    fn push(
        &mut self,
        task_id: TaskId,
        created_at: DateTime<Utc>,
        kind: TaskEventKind,
        at: DateTime<Utc>,
    ) -> TaskEvent {
        let since = self.started_at.unwrap_or(created_at);
        let event = TaskEvent {
            seq: self.timeline.len() as u64,
            task_id,
            timestamp: at,
            elapsed_ms: (at - since).num_milliseconds().max(0) as u64,
            kind,
        };
        self.timeline.push(event.clone());
        event
    }
}

/// Read-only copy of a task record, as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub question: String,
    pub params: ResearchParams,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<ResearchResult>,
    pub error: Option<String>,
    pub pages_visited: u32,
    pub events: Vec<TaskEvent>,
}

impl TaskSnapshot {
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            "what is rust?".to_string(),
            ResearchParams::default(),
            Utc::now(),
        )
    }

    #[test]
    fn terminal_status_never_changes() {
        let r = record();
        let now = Utc::now();
        assert!(r.transition(TaskStatus::Running, now));
        assert!(r.finish(TaskStatus::Completed, Some(ResearchResult::new("ok", 0.9)), None, now));

        assert!(!r.transition(TaskStatus::Failed, now));
        assert!(!r.finish(TaskStatus::Timeout, None, Some("late".into()), now));
        assert_eq!(r.status(), TaskStatus::Completed);
        assert_eq!(r.snapshot().error, None);
    }

    #[test]
    fn queued_task_cannot_complete_without_running() {
        let r = record();
        assert!(!r.finish(TaskStatus::Completed, None, None, Utc::now()));
        assert!(r.finish(TaskStatus::Cancelled, None, Some("user".into()), Utc::now()));
    }

    #[test]
    fn timeline_is_append_only_and_sealed_once() {
        let r = record();
        let t0 = Utc::now();
        r.transition(TaskStatus::Running, t0);
        let first = r.append_event(TaskEventKind::thinking("a"), t0).unwrap();
        let second = r
            .append_event(TaskEventKind::thinking("b"), t0 + Duration::milliseconds(40))
            .unwrap();
        assert_eq!((first.seq, second.seq), (0, 1));
        assert_eq!(second.elapsed_ms, 40);

        r.finish(TaskStatus::Completed, None, None, t0);
        assert!(r.append_event(TaskEventKind::thinking("late"), t0).is_none());

        let closing = r.seal(
            vec![TaskEventKind::Status {
                status: TaskStatus::Completed,
            }],
            t0,
        );
        assert_eq!(closing.len(), 1);
        assert!(closing[0].is_terminal());
        assert!(r.seal(vec![TaskEventKind::thinking("again")], t0).is_empty());
        assert_eq!(r.timeline().len(), 3);
    }

    #[test]
    fn partial_result_survives_finish_without_result() {
        let r = record();
        r.transition(TaskStatus::Running, Utc::now());
        r.record_partial(ResearchResult::new("half", 0.4));
        r.finish(TaskStatus::Timeout, None, Some("task exceeded time budget".into()), Utc::now());

        let snap = r.snapshot();
        let result = snap.result.unwrap();
        assert!(result.partial);
        assert_eq!(result.answer, "half");
    }

    #[test]
    fn snapshot_uses_camel_case() {
        let r = record();
        let v = serde_json::to_value(r.snapshot()).unwrap();
        assert_eq!(v["status"], "queued");
        assert!(v.get("pagesVisited").is_some());
        assert!(v.get("createdAt").is_some());
    }

    #[tokio::test]
    async fn wait_finished_resolves_after_seal() {
        let r = std::sync::Arc::new(record());
        let waiter = {
            let r = std::sync::Arc::clone(&r);
            tokio::spawn(async move { r.wait_finished().await })
        };
        r.finish(TaskStatus::Cancelled, None, None, Utc::now());
        r.seal(Vec::new(), Utc::now());
        waiter.await.unwrap();
    }
}
