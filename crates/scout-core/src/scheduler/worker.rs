//! One task execution: run the body under a deadline, then finalize.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Shared;
use super::context::TaskContext;
use super::record::TaskRecord;
use crate::broadcast::EventBroadcaster;
use crate::domain::{ResearchResult, TaskEventKind, TaskStatus};
use crate::error::{AgentError, BroadcastError};
use crate::ports::{Clock, ResearchRequest};

pub(crate) const TIMEOUT_MESSAGE: &str = "task exceeded time budget";
const DEFAULT_CANCEL_REASON: &str = "task cancelled";

type BodyResult = Result<ResearchResult, AgentError>;

/// How a run ended. Interrupted runs carry whatever the body returned within the
/// grace period, if anything.
pub(super) enum Ending {
    Finished(BodyResult),
    TimedOut(Option<BodyResult>),
    Cancelled(Option<BodyResult>),
}

enum Interrupt {
    Deadline,
    Cancel,
}

/// Run one task. The permit is held until the record is finalized and the body
/// has been dropped.
pub(super) async fn run_task(
    shared: Arc<Shared>,
    record: Arc<TaskRecord>,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    let task_id = record.id();

    // キューから取り出した直後にキャンセルされたケース
    if cancel.is_cancelled() {
        finalize(&shared, &record, Ending::Cancelled(None)).await;
        drop(permit);
        return;
    }
    if !record.transition(TaskStatus::Running, shared.clock.now()) {
        drop(permit);
        return;
    }
    info!(task_id = %task_id, "task started");
    publish(
        &shared,
        &record,
        TaskEventKind::Status {
            status: TaskStatus::Running,
        },
    )
    .await;

    let ctx = TaskContext::new(
        Arc::clone(&record),
        Arc::clone(&shared.gate),
        Arc::clone(&shared.fetcher),
        Arc::clone(&shared.broadcaster),
        Arc::clone(&shared.clock),
        cancel.clone(),
        shared.overload_threshold,
    );
    let request = ResearchRequest {
        task_id,
        question: record.question().to_string(),
        params: record.params().clone(),
    };

    let deadline = Instant::now() + record.params().time_budget();
    let mut body = AssertUnwindSafe(shared.agent.run(request, ctx))
        .catch_unwind()
        .map(|run| run.unwrap_or_else(|_| Err(AgentError::fatal("task body panicked"))));

    let interrupted = tokio::select! {
        biased;
        result = &mut body => Ok(result),
        _ = cancel.cancelled() => Err(Interrupt::Cancel),
        _ = sleep_until(deadline) => Err(Interrupt::Deadline),
    };

    let ending = match interrupted {
        // a body that bails out because of the cancellation still counts as cancelled
        Ok(Err(err)) if cancel.is_cancelled() => Ending::Cancelled(Some(Err(err))),
        Ok(result) => Ending::Finished(result),
        Err(why) => {
            if matches!(why, Interrupt::Deadline) {
                warn!(task_id = %task_id, "time budget exceeded; cancelling task body");
            }
            cancel.cancel();
            let late = timeout(shared.config.grace_period(), &mut body).await.ok();
            if late.is_none() {
                warn!(task_id = %task_id, "task body ignored cancellation; dropping it");
            }
            match why {
                Interrupt::Deadline => Ending::TimedOut(late),
                Interrupt::Cancel => Ending::Cancelled(late),
            }
        }
    };
    drop(body);

    finalize(&shared, &record, ending).await;
    drop(permit);
}

/// Move the record to its terminal state, publish the closing events and close the
/// task's channel. A record that is already terminal is left untouched.
pub(super) async fn finalize(shared: &Shared, record: &TaskRecord, ending: Ending) {
    let task_id = record.id();
    let now = shared.clock.now();
    let duration_ms = record
        .started_at()
        .map_or(0, |started| (now - started).num_milliseconds().max(0) as u64);

    let (status, result, error, mut closing) = match ending {
        Ending::Finished(Ok(result)) => {
            let complete = TaskEventKind::Complete {
                answer: result.answer.clone(),
                citations: result.citations.clone(),
                duration_ms,
            };
            (TaskStatus::Completed, Some(result), None, vec![complete])
        }
        Ending::Finished(Err(AgentError::Recoverable { message, partial })) => (
            TaskStatus::Failed,
            partial.map(into_partial),
            Some(message.clone()),
            vec![TaskEventKind::Error {
                error: message,
                recoverable: true,
            }],
        ),
        Ending::Finished(Err(AgentError::Fatal(message))) => (
            TaskStatus::Failed,
            None,
            Some(message.clone()),
            vec![TaskEventKind::Error {
                error: message,
                recoverable: false,
            }],
        ),
        Ending::TimedOut(late) => (
            TaskStatus::Timeout,
            late.and_then(salvage),
            Some(TIMEOUT_MESSAGE.to_string()),
            vec![TaskEventKind::Error {
                error: TIMEOUT_MESSAGE.to_string(),
                recoverable: false,
            }],
        ),
        Ending::Cancelled(late) => (
            TaskStatus::Cancelled,
            late.and_then(salvage),
            Some(
                record
                    .cancel_reason()
                    .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string()),
            ),
            Vec::new(),
        ),
    };

    if !record.finish(status, result, error.clone(), now) {
        return;
    }
    match status {
        TaskStatus::Completed => info!(task_id = %task_id, duration_ms, "task completed"),
        TaskStatus::Failed => error!(task_id = %task_id, error = ?error, "task failed"),
        TaskStatus::Timeout => warn!(task_id = %task_id, duration_ms, "task timed out"),
        _ => info!(task_id = %task_id, reason = ?error, "task cancelled"),
    }

    closing.push(TaskEventKind::Status { status });
    let _stream = record.lock_stream().await;
    for event in record.seal(closing, now) {
        if let Err(err) = shared.broadcaster.publish(task_id, event).await {
            warn!(task_id = %task_id, error = %err, "closing event not streamed");
        }
    }
    shared.broadcaster.close(task_id);
    shared.tokens.remove(&task_id);
}

pub(super) async fn publish(shared: &Shared, record: &TaskRecord, kind: TaskEventKind) {
    if let Err(err) = append_and_stream(&shared.broadcaster, shared.clock.as_ref(), record, kind).await {
        warn!(task_id = %record.id(), error = %err, "status event not streamed");
    }
}

/// Append `kind` to the timeline and queue it for subscribers under the record's
/// stream lock. Nothing is appended or streamed once the task is terminal.
pub(super) async fn append_and_stream(
    broadcaster: &EventBroadcaster,
    clock: &dyn Clock,
    record: &TaskRecord,
    kind: TaskEventKind,
) -> Result<(), BroadcastError> {
    let _stream = record.lock_stream().await;
    let Some(event) = record.append_event(kind, clock.now()) else {
        return Ok(());
    };
    broadcaster.publish(record.id(), event).await
}

fn into_partial(mut result: ResearchResult) -> ResearchResult {
    result.partial = true;
    result
}

/// Whatever a body handed back after it was interrupted counts as partial.
fn salvage(late: BodyResult) -> Option<ResearchResult> {
    match late {
        Ok(result) => Some(into_partial(result)),
        Err(AgentError::Recoverable {
            partial: Some(result),
            ..
        }) => Some(into_partial(result)),
        Err(_) => None,
    }
}
