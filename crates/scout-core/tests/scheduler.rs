//! End-to-end scheduler scenarios over in-memory fakes.
//!
//! Time is paused in every test: sleeps (spacing delays, window waits, grace
//! periods, time budgets) complete instantly in wall-clock terms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use scout_core::browsing::{DomainFilter, DomainList, RateLimitStore, RateLimiter};
use scout_core::config::{EventsConfig, RateLimitConfig, SchedulerConfig};
use scout_core::impls::StaticPageFetcher;
use scout_core::ports::IdGenerator;
use scout_core::{
    AgentError, BrowsingGate, CancelAck, Citation, FetchError, NavigationError, ResearchAgent,
    ResearchParams, ResearchRequest, ResearchResult, SchedulerError, TaskContext, TaskEventKind,
    TaskId, TaskScheduler, TaskStatus,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use ulid::Ulid;

/// Behaviour is picked by the first word of the question.
struct ScriptedAgent;

#[async_trait]
impl ResearchAgent for ScriptedAgent {
    async fn run(&self, request: ResearchRequest, ctx: TaskContext) -> Result<ResearchResult, AgentError> {
        let mut words = request.question.split_whitespace();
        match words.next() {
            Some("stall") => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ResearchResult::new("too late", 0.1))
            }
            Some("cooperate") => {
                ctx.cancelled().await;
                Err(NavigationError::Cancelled.into())
            }
            Some("partial") => {
                ctx.record_partial(ResearchResult::new("half an answer", 0.3));
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ResearchResult::new("too late", 0.1))
            }
            Some("think") => {
                for step in 0..3 {
                    ctx.emit(TaskEventKind::thinking(format!("step {step}"))).await?;
                }
                let seed = request.params.seed_url.clone().unwrap_or_default();
                let page = ctx.navigate(&seed).await?;
                Ok(ResearchResult::new(page.text.clone(), 0.8)
                    .with_citation(Citation::new(page.final_url, page.title)))
            }
            Some("fallback") => {
                // a refused page is skipped, not fatal
                let mut answer = ResearchResult::new("answered without browsing", 0.2);
                for url in words {
                    match ctx.navigate(url).await {
                        Ok(page) => answer = answer.with_citation(Citation::new(page.final_url, page.title)),
                        Err(NavigationError::DomainBlocked { .. }) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(answer)
            }
            Some("chorus") => {
                let mut voices = JoinSet::new();
                for voice in 0..8 {
                    let ctx = ctx.clone();
                    voices.spawn(async move {
                        for line in 0..40 {
                            ctx.emit(TaskEventKind::thinking(format!("voice {voice} line {line}")))
                                .await?;
                        }
                        Ok::<_, NavigationError>(())
                    });
                }
                while let Some(joined) = voices.join_next().await {
                    joined.map_err(|e| AgentError::fatal(e.to_string()))??;
                }
                Ok(ResearchResult::new("sung", 0.5))
            }
            Some("visit") => {
                let mut titles = Vec::new();
                for url in words {
                    let page = ctx.navigate(url).await?;
                    titles.push(page.title);
                }
                Ok(ResearchResult::new(titles.join(", "), 0.5))
            }
            _ => Err(AgentError::fatal("unknown script")),
        }
    }
}

fn build(
    fetcher: Arc<StaticPageFetcher>,
    deny: &[&str],
    scheduler: SchedulerConfig,
    rate_limit: RateLimitConfig,
) -> TaskScheduler {
    let filter = DomainFilter::new(DomainList::from_lines(Vec::<&str>::new(), deny.iter().copied()));
    let limiter = RateLimiter::with_rng_seed(rate_limit.clone(), Arc::new(RateLimitStore::new()), 9);
    let gate = BrowsingGate::new(Arc::new(filter), Arc::new(limiter));
    TaskScheduler::builder(Arc::new(ScriptedAgent), fetcher)
        .scheduler_config(scheduler)
        .rate_limit_config(rate_limit)
        .gate(Arc::new(gate))
        .build()
}

fn pool(max_concurrent_tasks: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_tasks,
        ..SchedulerConfig::default()
    }
}

/// Hands out ids in a known order, so a test can address a task before `submit`
/// returns.
struct PresetIds(parking_lot::Mutex<VecDeque<TaskId>>);

impl PresetIds {
    fn new(ids: impl IntoIterator<Item = TaskId>) -> Self {
        Self(parking_lot::Mutex::new(ids.into_iter().collect()))
    }
}

impl IdGenerator for PresetIds {
    fn generate_task_id(&self) -> TaskId {
        self.0
            .lock()
            .pop_front()
            .unwrap_or_else(|| TaskId::from_ulid(Ulid::new()))
    }
}

async fn wait_for_status(scheduler: &TaskScheduler, id: TaskId, status: TaskStatus) {
    while scheduler.status(id).unwrap().status != status {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn blocked_seed_degrades_to_an_answer_without_it() {
    let fetcher = Arc::new(StaticPageFetcher::new().page("https://blocked.example.com", "x", "x"));
    let scheduler = build(
        Arc::clone(&fetcher),
        &["blocked.example.com"],
        pool(5),
        RateLimitConfig::default(),
    );
    let params = ResearchParams::default()
        .with_seed_url("https://blocked.example.com")
        .with_max_depth(1)
        .with_max_pages(1);

    let id = scheduler
        .submit("fallback https://blocked.example.com", params)
        .await
        .unwrap();
    let snap = scheduler.wait(id).await.unwrap();

    assert_eq!(snap.status, TaskStatus::Completed, "{:?}", snap.error);
    let result = snap.result.unwrap();
    assert_eq!(result.answer, "answered without browsing");
    assert!(result.citations.is_empty());
    assert!(fetcher.fetched().is_empty());
    assert_eq!(snap.pages_visited, 0);
    assert!(snap.events.iter().any(|e| matches!(
        &e.kind,
        TaskEventKind::Blocked { url, reason }
            if url == "https://blocked.example.com" && reason.contains("domain blocked")
    )));
    assert!(snap.events.iter().any(|e| e.kind.name() == "agent:blocked"));
}

#[tokio::test(start_paused = true)]
async fn blocked_seed_fails_a_body_that_gives_up_on_it() {
    let fetcher = Arc::new(StaticPageFetcher::new().page("https://blocked.example.com", "x", "x"));
    let scheduler = build(
        Arc::clone(&fetcher),
        &["blocked.example.com"],
        pool(5),
        RateLimitConfig::default(),
    );
    let params = ResearchParams::default()
        .with_seed_url("https://blocked.example.com")
        .with_max_depth(1)
        .with_max_pages(1);

    let id = scheduler
        .submit("visit https://blocked.example.com", params)
        .await
        .unwrap();
    let snap = scheduler.wait(id).await.unwrap();

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.unwrap().contains("domain blocked"));
    assert!(fetcher.fetched().is_empty());
    assert!(snap.events.iter().any(|e| matches!(
        &e.kind,
        TaskEventKind::Blocked { reason, .. } if reason.contains("domain blocked")
    )));
}

#[tokio::test(start_paused = true)]
async fn only_k_tasks_run_and_the_rest_stay_queued() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(3),
        RateLimitConfig::default(),
    );
    let mut ids = Vec::new();
    for _ in 0..7 {
        ids.push(scheduler.submit("cooperate", ResearchParams::default()).await.unwrap());
    }
    while scheduler.counts().running < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // give the dispatcher every chance to over-admit
    tokio::time::sleep(Duration::from_secs(1)).await;

    let counts = scheduler.counts();
    assert_eq!(counts.running, 3);
    assert_eq!(counts.queued, 4);
    assert_eq!(counts.available_slots, 0);

    // FIFO: the first three submitted are the ones running
    for id in &ids[..3] {
        assert_eq!(scheduler.status(*id).unwrap().status, TaskStatus::Running);
    }

    scheduler.shutdown().await;
    assert_eq!(scheduler.counts().cancelled, 7);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_stuck_task_frees_its_slot_after_grace() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(1),
        RateLimitConfig::default(),
    );
    let stuck = scheduler.submit("stall", ResearchParams::default()).await.unwrap();
    let next = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
    wait_for_status(&scheduler, stuck, TaskStatus::Running).await;
    assert_eq!(scheduler.status(next).unwrap().status, TaskStatus::Queued);

    let started = Instant::now();
    assert_eq!(
        scheduler.cancel(stuck, "user request").await.unwrap(),
        CancelAck::Cancelling
    );
    let snap = scheduler.wait(stuck).await.unwrap();
    let took = started.elapsed();

    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert_eq!(snap.error.as_deref(), Some("user request"));
    assert!(took >= Duration::from_secs(5) && took <= Duration::from_secs(6), "{took:?}");

    wait_for_status(&scheduler, next, TaskStatus::Running).await;

    // a cooperative body ends right away
    let started = Instant::now();
    scheduler.cancel(next, "done").await.unwrap();
    let snap = scheduler.wait(next).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn queued_task_is_cancelled_immediately() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(1),
        RateLimitConfig::default(),
    );
    let running = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
    let queued = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
    wait_for_status(&scheduler, running, TaskStatus::Running).await;

    assert_eq!(scheduler.cancel(queued, "nevermind").await.unwrap(), CancelAck::Cancelled);
    let snap = scheduler.status(queued).unwrap();
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(snap.started_at.is_none());

    assert_eq!(
        scheduler.cancel(queued, "again").await.unwrap(),
        CancelAck::AlreadyFinished(TaskStatus::Cancelled)
    );
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timeout_keeps_the_partial_result() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(2),
        RateLimitConfig::default(),
    );
    let params = ResearchParams::default().with_time_budget(Duration::from_secs(30));
    let started = Instant::now();
    let id = scheduler.submit("partial", params).await.unwrap();
    let snap = scheduler.wait(id).await.unwrap();

    assert_eq!(snap.status, TaskStatus::Timeout);
    assert_eq!(snap.error.as_deref(), Some("task exceeded time budget"));
    let result = snap.result.unwrap();
    assert!(result.partial);
    assert_eq!(result.answer, "half an answer");

    // budget + grace
    let took = started.elapsed();
    assert!(took >= Duration::from_secs(35) && took <= Duration::from_secs(36), "{took:?}");
}

#[tokio::test(start_paused = true)]
async fn early_and_late_subscribers_see_the_same_events() {
    let fetcher = Arc::new(StaticPageFetcher::new().page("https://docs.example.com", "Docs", "forty-two"));
    let scheduler = build(fetcher, &[], pool(2), RateLimitConfig::default());
    let params = ResearchParams::default().with_seed_url("https://docs.example.com");

    let id = scheduler.submit("think", params).await.unwrap();
    let early = scheduler.stream_events(id).unwrap();
    let snap = scheduler.wait(id).await.unwrap();
    let late = scheduler.stream_events(id).unwrap();

    let early: Vec<_> = early.collect().await;
    let late: Vec<_> = late.collect().await;
    let names = |events: &[scout_core::TaskEvent]| {
        events.iter().map(|e| (e.seq, e.kind.name())).collect::<Vec<_>>()
    };

    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(names(&early), names(&late));
    assert_eq!(names(&early), names(&snap.events));
    assert_eq!(
        early.iter().map(|e| e.kind.name()).collect::<Vec<_>>(),
        vec![
            "agent:status",
            "agent:status",
            "agent:thinking",
            "agent:thinking",
            "agent:thinking",
            "agent:navigation",
            "agent:complete",
            "agent:status",
        ]
    );
    assert!(early.last().unwrap().is_terminal());

    let result = snap.result.unwrap();
    assert_eq!(result.answer, "forty-two");
    assert_eq!(result.citations[0].title, "Docs");
}

#[tokio::test(start_paused = true)]
async fn sixth_request_to_a_host_waits_for_the_window() {
    let mut fetcher = StaticPageFetcher::new();
    let mut question = String::from("visit");
    for i in 0..6 {
        let url = format!("https://example.com/p{i}");
        fetcher = fetcher.page(&url, &format!("p{i}"), "body");
        question.push(' ');
        question.push_str(&url);
    }
    let scheduler = build(Arc::new(fetcher), &[], pool(1), RateLimitConfig::default());
    let params = ResearchParams::default().with_time_budget(Duration::from_secs(300));

    let id = scheduler.submit(&question, params).await.unwrap();
    let snap = scheduler.wait(id).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Completed, "{:?}", snap.error);

    let waits: Vec<u64> = snap
        .events
        .iter()
        .filter_map(|e| match &e.kind {
            TaskEventKind::Navigation { waited_ms, .. } => Some(*waited_ms),
            _ => None,
        })
        .collect();
    assert_eq!(waits.len(), 6);
    assert_eq!(waits[0], 0);
    for w in &waits[1..5] {
        assert!((10_000..=20_000).contains(w), "spacing {w}");
    }
    let since_first: u64 = waits[1..].iter().sum();
    assert!(since_first >= 90_000, "sixth request came {since_first}ms after the first");
}

#[tokio::test(start_paused = true)]
async fn persistent_overload_gives_up_after_three_attempts() {
    let overloaded = || {
        Err(FetchError::Overloaded {
            retry_after: Some(Duration::from_secs(2)),
        })
    };
    let fetcher = Arc::new(
        StaticPageFetcher::new()
            .respond("https://busy.test", overloaded())
            .respond("https://busy.test", overloaded())
            .respond("https://busy.test", overloaded()),
    );
    let rate_limit = RateLimitConfig {
        window_secs: 10,
        delay_min_secs: 0,
        delay_max_secs: 0,
        backoff_max_secs: 20,
        ..RateLimitConfig::default()
    };
    let scheduler = build(Arc::clone(&fetcher), &[], pool(1), rate_limit);

    let id = scheduler
        .submit("visit busy.test", ResearchParams::default())
        .await
        .unwrap();
    let snap = scheduler.wait(id).await.unwrap();

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.unwrap().contains("overload"));
    assert_eq!(fetcher.fetched().len(), 3);
    let backoffs = snap
        .events
        .iter()
        .filter(|e| matches!(e.kind, TaskEventKind::RateLimited { .. }))
        .count();
    assert_eq!(backoffs, 2);
}

#[tokio::test(start_paused = true)]
async fn page_budget_and_scope_are_enforced() {
    let fetcher = Arc::new(
        StaticPageFetcher::new()
            .page("https://example.com/a", "a", "a")
            .page("https://example.com/b", "b", "b")
            .page("https://other.org", "o", "o"),
    );
    let scheduler = build(Arc::clone(&fetcher), &[], pool(2), RateLimitConfig::default());

    let budget = ResearchParams::default().with_max_pages(1);
    let id = scheduler
        .submit("visit https://example.com/a https://example.com/b", budget)
        .await
        .unwrap();
    let snap = scheduler.wait(id).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.pages_visited, 1);
    assert!(snap.error.unwrap().contains("page budget"));

    let scoped = ResearchParams::default()
        .with_seed_url("https://example.com")
        .with_same_domain_only(true);
    let id = scheduler.submit("visit https://other.org", scoped).await.unwrap();
    let snap = scheduler.wait(id).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error.unwrap().contains("outside the task scope"));
    assert!(!fetcher.fetched().iter().any(|u| u.contains("other.org")));
}

#[tokio::test(start_paused = true)]
async fn invalid_submissions_are_rejected() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(1),
        RateLimitConfig::default(),
    );
    assert!(scheduler.submit("   ", ResearchParams::default()).await.is_err());
    let bad = ResearchParams::default().with_max_pages(0);
    assert!(scheduler.submit("fine question", bad).await.is_err());
    assert_eq!(scheduler.list(0, 10).1, 0);

    scheduler.shutdown().await;
    assert!(matches!(
        scheduler.submit("late", ResearchParams::default()).await,
        Err(scout_core::SchedulerError::ShuttingDown)
    ));
}

#[tokio::test(start_paused = true)]
async fn list_pages_tasks_and_remove_forgets_them() {
    let scheduler = build(
        Arc::new(StaticPageFetcher::new()),
        &[],
        pool(1),
        RateLimitConfig::default(),
    );
    let first = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();

    let (page, total) = scheduler.list(0, 10);
    assert_eq!(total, 2);
    assert_eq!(page.len(), 2);

    let removed = scheduler.remove(second).await.unwrap();
    assert_eq!(removed.id, second);
    assert!(scheduler.status(second).is_err());
    assert!(scheduler.stream_events(second).is_err());
    assert_eq!(scheduler.list(0, 10).1, 1);
    assert_eq!(scheduler.list(0, 10).0[0].id, first);

    scheduler.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emits_stream_in_timeline_order() {
    let events = EventsConfig {
        backlog: 512,
        subscriber_capacity: 512,
        publish_timeout_ms: 5_000,
        ..EventsConfig::default()
    };
    for _ in 0..10 {
        let scheduler = TaskScheduler::builder(Arc::new(ScriptedAgent), Arc::new(StaticPageFetcher::new()))
            .scheduler_config(pool(1))
            .events_config(events.clone())
            .build();
        let id = scheduler.submit("chorus", ResearchParams::default()).await.unwrap();
        let mut sub = scheduler.stream_events(id).unwrap();

        let mut streamed = Vec::new();
        while let Some(event) = sub.recv().await {
            streamed.push(event.seq);
        }
        let snap = scheduler.wait(id).await.unwrap();

        assert_eq!(snap.status, TaskStatus::Completed, "{:?}", snap.error);
        assert!(!sub.lagged());
        // queued + running + 320 thoughts + complete + final status
        assert_eq!(snap.events.len(), 324);
        assert_eq!(streamed, (0..snap.events.len() as u64).collect::<Vec<_>>());
        scheduler.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_submit_always_finds_the_task_queued() {
    for _ in 0..25 {
        let busy = TaskId::from_ulid(Ulid::new());
        let target = TaskId::from_ulid(Ulid::new());
        let scheduler = Arc::new(
            TaskScheduler::builder(Arc::new(ScriptedAgent), Arc::new(StaticPageFetcher::new()))
                .scheduler_config(pool(1))
                .id_generator(Arc::new(PresetIds::new([busy, target])))
                .build(),
        );
        scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
        wait_for_status(&scheduler, busy, TaskStatus::Running).await;

        let canceller = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                loop {
                    match scheduler.cancel(target, "changed my mind").await {
                        Err(SchedulerError::UnknownTask(_)) => tokio::task::yield_now().await,
                        other => return other.unwrap(),
                    }
                }
            })
        };
        let submitted = scheduler.submit("cooperate", ResearchParams::default()).await.unwrap();
        assert_eq!(submitted, target);

        // the only slot is taken, so anything but an immediate cancel would leave it waiting
        assert_eq!(canceller.await.unwrap(), CancelAck::Cancelled);
        let snap = scheduler.status(target).unwrap();
        assert_eq!(snap.status, TaskStatus::Cancelled);
        assert!(snap.started_at.is_none());
        assert_eq!(snap.error.as_deref(), Some("changed my mind"));

        scheduler.shutdown().await;
    }
}
