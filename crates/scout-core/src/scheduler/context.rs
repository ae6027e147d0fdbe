//! The handle a running task body gets: its only way to browse and to report.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broadcast::EventBroadcaster;
use crate::browsing::{BrowsingGate, OverloadTracker, normalize_host, parse_navigable};
use crate::domain::{ResearchResult, TaskEventKind, TaskId};
use crate::error::NavigationError;
use crate::ports::{Clock, FetchError, PageContent, PageFetcher};

use super::record::TaskRecord;
use super::worker::append_and_stream;

/// Per-task capability object passed to [`crate::ports::ResearchAgent::run`].
///
/// Cloning is cheap; all clones share the task's record, cancellation token and
/// overload accounting. There is no way to reach a fetcher without going through
/// the gate.
#[derive(Clone)]
pub struct TaskContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    record: Arc<TaskRecord>,
    gate: Arc<BrowsingGate>,
    fetcher: Arc<dyn PageFetcher>,
    broadcaster: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    overloads: Mutex<OverloadTracker>,
    overload_threshold: u32,
    seed_host: Option<String>,
}

impl TaskContext {
    pub(crate) fn new(
        record: Arc<TaskRecord>,
        gate: Arc<BrowsingGate>,
        fetcher: Arc<dyn PageFetcher>,
        broadcaster: Arc<EventBroadcaster>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
        overload_threshold: u32,
    ) -> Self {
        let seed_host = record.params().seed_host();
        Self {
            inner: Arc::new(ContextInner {
                record,
                gate,
                fetcher,
                broadcaster,
                clock,
                cancel,
                overloads: Mutex::new(OverloadTracker::new()),
                overload_threshold: overload_threshold.max(1),
                seed_host,
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.record.id()
    }

    /// Fetch `url` once the domain filter and the rate limiter admit it.
    ///
    /// Suspends while the host's window is full or the host is backing off. Fails
    /// fast on cancellation, a blocked domain, a scope violation or an exhausted
    /// page budget.
    pub async fn navigate(&self, url: &str) -> Result<PageContent, NavigationError> {
        self.checkpoint()?;
        let inner = &self.inner;
        let params = inner.record.params();

        if inner.record.pages_visited() >= params.max_pages {
            let err = NavigationError::PageBudgetExhausted {
                max_pages: params.max_pages,
            };
            self.report_blocked(url, &err).await;
            return Err(err);
        }

        let target = parse_navigable(url)?;
        let host = target.host_str().map(normalize_host).unwrap_or_default();
        if params.same_domain_only
            && let Some(seed) = &inner.seed_host
            && !in_scope(&host, seed)
        {
            let err = NavigationError::OutOfScope {
                host,
                seed_host: seed.clone(),
            };
            self.report_blocked(url, &err).await;
            return Err(err);
        }

        loop {
            let admitted = match inner.gate.before_navigate(url, &inner.cancel).await {
                Ok(admitted) => admitted,
                Err(err @ NavigationError::DomainBlocked { .. }) => {
                    self.report_blocked(url, &err).await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            let fetched = tokio::select! {
                _ = inner.cancel.cancelled() => return Err(NavigationError::Cancelled),
                fetched = inner.fetcher.fetch(&admitted.url) => fetched,
            };

            match fetched {
                Ok(page) => {
                    inner.gate.limiter().record_success(&admitted.host);
                    inner.overloads.lock().record_success(&admitted.host);
                    inner.record.increment_pages();
                    self.publish(TaskEventKind::Navigation {
                        url: page.final_url.clone(),
                        waited_ms: admitted.waited.as_millis() as u64,
                    })
                    .await;
                    return Ok(page);
                }
                Err(FetchError::Overloaded { retry_after }) => {
                    let consecutive = inner.overloads.lock().record_overload(&admitted.host);
                    let wait = inner.gate.limiter().record_overload(&admitted.host, retry_after);
                    if consecutive >= inner.overload_threshold {
                        warn!(
                            task_id = %self.task_id(),
                            host = %admitted.host,
                            attempts = consecutive,
                            "giving up on overloaded host"
                        );
                        return Err(NavigationError::OverloadExhausted {
                            host: admitted.host,
                            attempts: consecutive,
                        });
                    }
                    self.publish(TaskEventKind::RateLimited {
                        host: admitted.host,
                        wait_ms: wait.as_millis() as u64,
                        consecutive,
                    })
                    .await;
                    // the host is now blocked; the next pass through the gate waits it out
                }
                Err(err) => return Err(NavigationError::Fetch(err)),
            }
        }
    }

    /// Append a progress event to the timeline and stream it to subscribers.
    ///
    /// Refused with `Cancelled` once the task has been cancelled or timed out.
    pub async fn emit(&self, kind: TaskEventKind) -> Result<(), NavigationError> {
        self.checkpoint()?;
        self.publish(kind).await;
        Ok(())
    }

    /// Keep the best answer so far; it survives a timeout or a failure.
    pub fn record_partial(&self, result: ResearchResult) {
        self.inner.record.record_partial(result);
    }

    /// Cooperative cancellation point for long computations between navigations.
    pub fn checkpoint(&self) -> Result<(), NavigationError> {
        if self.inner.cancel.is_cancelled() {
            Err(NavigationError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled or runs out of time.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn pages_visited(&self) -> u32 {
        self.inner.record.pages_visited()
    }

    async fn report_blocked(&self, url: &str, err: &NavigationError) {
        warn!(task_id = %self.task_id(), url, error = %err, "navigation blocked");
        self.publish(TaskEventKind::Blocked {
            url: url.to_string(),
            reason: err.to_string(),
        })
        .await;
    }

    async fn publish(&self, kind: TaskEventKind) {
        let inner = &self.inner;
        let streamed =
            append_and_stream(&inner.broadcaster, inner.clock.as_ref(), &inner.record, kind).await;
        if let Err(err) = streamed {
            debug!(task_id = %inner.record.id(), error = %err, "event not streamed");
        }
    }
}

/// Same host as the seed, or one of its subdomains.
fn in_scope(host: &str, seed: &str) -> bool {
    host == seed
        || host
            .strip_suffix(seed)
            .is_some_and(|head| head.ends_with('.'))
}
