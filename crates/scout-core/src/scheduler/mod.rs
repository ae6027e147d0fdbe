//! Task scheduler: bounded worker pool over a tiered admission queue.
//!
//! State transitions:
//! - Queued -> Running -> Completed | Failed | Timeout | Cancelled
//! - Queued -> Cancelled (dequeued before it ever took a slot)
//!
//! A dispatcher task takes a semaphore permit, pops the next queued task and hands
//! both to a worker. The worker holds the permit until the record is final, so at
//! most `max_concurrent_tasks` bodies run at any time.

mod context;
mod queue;
mod record;
mod worker;

pub use context::TaskContext;
pub use queue::TaskQueue;
pub use record::{TaskRecord, TaskSnapshot};

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{EventBroadcaster, EventSubscription};
use crate::browsing::{BrowsingGate, DomainFilter, RateLimitStore, RateLimiter};
use crate::config::{AppConfig, EventsConfig, MAX_CONCURRENCY_LIMIT, RateLimitConfig, SchedulerConfig};
use crate::domain::{ResearchParams, TaskEventKind, TaskId, TaskStatus, validate_question};
use crate::error::SchedulerError;
use crate::observability::SchedulerCounts;
use crate::ports::{Clock, IdGenerator, PageFetcher, ResearchAgent, SystemClock, UlidGenerator};

use worker::Ending;

const SHUTDOWN_REASON: &str = "scheduler shutting down";

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelAck {
    /// The task was still queued and is now cancelled.
    Cancelled,
    /// The task is running; it has been signalled and ends within the grace period.
    Cancelling,
    /// Nothing to do.
    AlreadyFinished(TaskStatus),
}

/// State shared by the scheduler handle, the dispatcher and the workers.
pub(crate) struct Shared {
    config: SchedulerConfig,
    overload_threshold: u32,
    records: DashMap<TaskId, Arc<TaskRecord>>,
    tokens: DashMap<TaskId, CancellationToken>,
    queue: Mutex<TaskQueue>,
    wakeup: Notify,
    slots: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    gate: Arc<BrowsingGate>,
    fetcher: Arc<dyn PageFetcher>,
    agent: Arc<dyn ResearchAgent>,
    broadcaster: Arc<EventBroadcaster>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Shared {
    /// Next task that is still waiting, with its token. Skips removed ids.
    fn next_queued(&self) -> Option<(Arc<TaskRecord>, CancellationToken)> {
        let mut queue = self.queue.lock();
        while let Some(task_id) = queue.pop(Instant::now()) {
            let Some(record) = self.records.get(&task_id).map(|r| Arc::clone(r.value())) else {
                continue;
            };
            if record.status() != TaskStatus::Queued {
                continue;
            }
            let token = self
                .tokens
                .get(&task_id)
                .map(|t| t.clone())
                .unwrap_or_else(|| self.shutdown.child_token());
            return Some((record, token));
        }
        None
    }

    fn record(&self, task_id: TaskId) -> Result<Arc<TaskRecord>, SchedulerError> {
        self.records
            .get(&task_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or(SchedulerError::UnknownTask(task_id))
    }
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn builder(agent: Arc<dyn ResearchAgent>, fetcher: Arc<dyn PageFetcher>) -> TaskSchedulerBuilder {
        TaskSchedulerBuilder::new(agent, fetcher)
    }

    /// Validate and enqueue a research task. It starts as soon as a slot is free.
    ///
    /// The time budget is capped by `scheduler.task_timeout_secs`.
    pub async fn submit(
        &self,
        question: &str,
        params: ResearchParams,
    ) -> Result<TaskId, SchedulerError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let question = validate_question(question)?;
        params.validate()?;
        let mut params = params;
        params.time_budget_secs = params
            .time_budget_secs
            .min(shared.config.task_timeout_secs);

        let task_id = shared.ids.generate_task_id();
        let priority = params.priority;
        let budget = params.time_budget();
        let record = Arc::new(TaskRecord::new(
            task_id,
            question,
            params,
            shared.clock.now(),
        ));

        shared.broadcaster.open(task_id);
        shared.tokens.insert(task_id, shared.shutdown.child_token());

        // まだ誰も id を知らないのでロックは即座に取れる
        let stream = record.lock_stream().await;
        let queued = record.append_event(
            TaskEventKind::Status {
                status: TaskStatus::Queued,
            },
            shared.clock.now(),
        );
        {
            // 登録とキュー投入を同じロックの下で行う: cancel は必ずキュー上のタスクを見る
            let mut queue = shared.queue.lock();
            shared.records.insert(task_id, Arc::clone(&record));
            queue.push(task_id, priority, budget, Instant::now());
        }
        shared.wakeup.notify_one();
        info!(task_id = %task_id, ?priority, budget_secs = budget.as_secs(), "task queued");

        if let Some(event) = queued
            && let Err(err) = shared.broadcaster.publish(task_id, event).await
        {
            warn!(task_id = %task_id, error = %err, "status event not streamed");
        }
        drop(stream);

        // shutdown が投入の前にキューを空にしていた場合
        if shared.shutdown.is_cancelled() && shared.queue.lock().remove(task_id) {
            record.set_cancel_reason(SHUTDOWN_REASON);
            worker::finalize(shared, &record, Ending::Cancelled(None)).await;
        }
        Ok(task_id)
    }

    pub fn status(&self, task_id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        Ok(self.shared.record(task_id)?.snapshot())
    }

    /// Cancel a task. A queued task is cancelled on the spot; a running one is
    /// signalled and ends within the grace period.
    pub async fn cancel(&self, task_id: TaskId, reason: &str) -> Result<CancelAck, SchedulerError> {
        let shared = &self.shared;
        let record = shared.record(task_id)?;
        let status = record.status();
        if status.is_terminal() {
            return Ok(CancelAck::AlreadyFinished(status));
        }
        record.set_cancel_reason(reason);

        // キューに残っていれば即キャンセル（スロットは消費しない）
        let dequeued = shared.queue.lock().remove(task_id);
        if dequeued {
            worker::finalize(shared, &record, Ending::Cancelled(None)).await;
            return Ok(CancelAck::Cancelled);
        }

        if let Some(token) = shared.tokens.get(&task_id) {
            token.cancel();
        }
        info!(task_id = %task_id, reason, "cancellation requested");
        Ok(CancelAck::Cancelling)
    }

    /// Replay the task's recent events, then follow it live until it ends.
    pub fn stream_events(&self, task_id: TaskId) -> Result<EventSubscription, SchedulerError> {
        self.shared.record(task_id)?;
        self.shared
            .broadcaster
            .subscribe(task_id)
            .map_err(|_| SchedulerError::UnknownTask(task_id))
    }

    /// Newest first. Returns the page and the total number of tasks.
    pub fn list(&self, offset: usize, limit: usize) -> (Vec<TaskSnapshot>, usize) {
        let mut records: Vec<Arc<TaskRecord>> = self
            .shared
            .records
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        let total = records.len();
        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        let page = records
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.snapshot())
            .collect();
        (page, total)
    }

    /// Drop a task's record and event channel, cancelling it first if still active.
    pub async fn remove(&self, task_id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let record = self.shared.record(task_id)?;
        if !record.status().is_terminal() {
            self.cancel(task_id, "task removed").await?;
        }
        self.shared.records.remove(&task_id);
        self.shared.broadcaster.remove(task_id);
        debug!(task_id = %task_id, "task removed");
        Ok(record.snapshot())
    }

    pub fn counts(&self) -> SchedulerCounts {
        let mut counts = SchedulerCounts::default();
        for record in self.shared.records.iter() {
            counts.add(record.status());
        }
        // the dispatcher may hold one idle permit while waiting for work
        counts.available_slots = self
            .shared
            .config
            .max_concurrent_tasks
            .saturating_sub(counts.running);
        counts
    }

    /// Wait until the task is terminal and its closing events are published.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskSnapshot, SchedulerError> {
        let record = self.shared.record(task_id)?;
        record.wait_finished().await;
        Ok(record.snapshot())
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.shared.config.max_concurrent_tasks
    }

    pub fn gate(&self) -> &Arc<BrowsingGate> {
        &self.shared.gate
    }

    /// Cancel everything, stop the dispatcher and wait for running tasks to end.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        info!("scheduler shutting down");
        for record in shared.records.iter() {
            if !record.status().is_terminal() {
                record.set_cancel_reason(SHUTDOWN_REASON);
            }
        }
        shared.shutdown.cancel();

        let drained = shared.queue.lock().drain();
        for task_id in drained {
            if let Ok(record) = shared.record(task_id) {
                worker::finalize(shared, &record, Ending::Cancelled(None)).await;
            }
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        let mut workers = std::mem::take(&mut *shared.workers.lock());
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn dispatch(shared: Arc<Shared>) {
    loop {
        // 空きスロットを先に確保してからキューを見る
        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&shared.slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = loop {
            if let Some(next) = shared.next_queued() {
                break Some(next);
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => break None,
                _ = shared.wakeup.notified() => {}
            }
        };
        let Some((record, token)) = next else {
            break;
        };

        debug!(task_id = %record.id(), "dispatching task");
        let run = worker::run_task(Arc::clone(&shared), record, token, permit);
        let mut workers = shared.workers.lock();
        workers.spawn(run);
        while let Some(joined) = workers.try_join_next() {
            if let Err(err) = joined {
                error!(error = %err, "worker ended abnormally");
            }
        }
    }
    debug!("dispatcher stopped");
}

/// Wires a [`TaskScheduler`]. Everything but the agent and the fetcher has a
/// default: system clock, ULID ids, an empty domain filter and a rate limiter
/// built from the rate-limit config.
pub struct TaskSchedulerBuilder {
    agent: Arc<dyn ResearchAgent>,
    fetcher: Arc<dyn PageFetcher>,
    scheduler: SchedulerConfig,
    rate_limit: RateLimitConfig,
    events: EventsConfig,
    gate: Option<Arc<BrowsingGate>>,
    broadcaster: Option<Arc<EventBroadcaster>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl TaskSchedulerBuilder {
    pub fn new(agent: Arc<dyn ResearchAgent>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            agent,
            fetcher,
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            events: EventsConfig::default(),
            gate: None,
            broadcaster: None,
            clock: None,
            ids: None,
        }
    }

    /// Take the scheduler, rate-limit and event sections of `config`.
    pub fn app_config(mut self, config: &AppConfig) -> Self {
        self.scheduler = config.scheduler.clone();
        self.rate_limit = config.rate_limit.clone();
        self.events = config.events.clone();
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn events_config(mut self, config: EventsConfig) -> Self {
        self.events = config;
        self
    }

    pub fn gate(mut self, gate: Arc<BrowsingGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn build(self) -> TaskScheduler {
        let mut scheduler = self.scheduler;
        scheduler.max_concurrent_tasks = scheduler
            .max_concurrent_tasks
            .clamp(1, MAX_CONCURRENCY_LIMIT);

        let overload_threshold = self.rate_limit.overload_threshold;
        let gate = self.gate.unwrap_or_else(|| {
            let limiter = RateLimiter::new(self.rate_limit, Arc::new(RateLimitStore::new()));
            Arc::new(BrowsingGate::new(
                Arc::new(DomainFilter::default()),
                Arc::new(limiter),
            ))
        });
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(EventBroadcaster::new(self.events)));

        let shared = Arc::new(Shared {
            slots: Arc::new(Semaphore::new(scheduler.max_concurrent_tasks)),
            config: scheduler,
            overload_threshold,
            records: DashMap::new(),
            tokens: DashMap::new(),
            queue: Mutex::new(TaskQueue::new()),
            wakeup: Notify::new(),
            workers: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
            gate,
            fetcher: self.fetcher,
            agent: self.agent,
            broadcaster,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self
                .ids
                .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock))),
        });

        info!(
            max_concurrent_tasks = shared.config.max_concurrent_tasks,
            grace_secs = shared.config.grace_period_secs,
            "scheduler started"
        );
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared)));
        TaskScheduler {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}
