//! scout-core
//!
//! Task orchestration and ethical-browsing control plane for a web research agent.
//!
//! # Modules
//! - **domain**: task ids, validated parameters, status machine, results, events
//! - **ports**: seams to collaborators (`ResearchAgent`, `PageFetcher`, `Clock`, `IdGenerator`)
//! - **browsing**: domain filter, per-host rate limiter, and the gate combining them
//! - **broadcast**: per-task event channels with backlog replay
//! - **scheduler**: bounded worker pool, task records, `TaskContext`
//! - **impls**: in-process port implementations for development and tests
//! - **config**: `AppConfig` (defaults, TOML, `SCOUT_*` environment)
//!
//! Every page a task body fetches goes through `TaskContext::navigate`, which
//! consults the gate before calling the fetcher.

pub mod broadcast;
pub mod browsing;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod scheduler;

pub use broadcast::{EventBroadcaster, EventSubscription};
pub use browsing::{BrowsingGate, DomainFilter, DomainList, RateLimitStore, RateLimiter};
pub use config::AppConfig;
pub use domain::{
    Citation, Priority, ResearchParams, ResearchResult, TaskEvent, TaskEventKind, TaskId,
    TaskStatus,
};
pub use error::{AgentError, BroadcastError, NavigationError, SchedulerError};
pub use observability::SchedulerCounts;
pub use ports::{FetchError, PageContent, PageFetcher, ResearchAgent, ResearchRequest};
pub use scheduler::{CancelAck, TaskContext, TaskScheduler, TaskSchedulerBuilder, TaskSnapshot};
