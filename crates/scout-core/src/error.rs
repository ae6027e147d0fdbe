use std::time::Duration;

use thiserror::Error;

use crate::domain::{ParamsError, ResearchResult, TaskId};
use crate::ports::FetchError;

/// Why a navigation requested by a task body did not produce a page.
///
/// Throttling is never reported here: the gate waits instead. Only overload that
/// persists across consecutive attempts surfaces, as `OverloadExhausted`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NavigationError {
    #[error("invalid url `{0}`")]
    InvalidUrl(String),

    #[error("unsupported scheme `{scheme}` (only http and https are allowed)")]
    UnsupportedScheme { scheme: String },

    #[error("domain blocked: {host}")]
    DomainBlocked { host: String },

    #[error("host {host} kept signalling overload ({attempts} consecutive attempts)")]
    OverloadExhausted { host: String, attempts: u32 },

    #[error("page budget exhausted ({max_pages} pages)")]
    PageBudgetExhausted { max_pages: u32 },

    #[error("{host} is outside the task scope (same-domain only: {seed_host})")]
    OutOfScope { host: String, seed_host: String },

    #[error("navigation cancelled")]
    Cancelled,

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

impl NavigationError {
    /// Recoverable errors leave the task free to try another url or produce a
    /// partial answer.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NavigationError::Cancelled)
    }
}

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    /// The task could not finish but may carry what it found so far.
    #[error("{message}")]
    Recoverable {
        message: String,
        partial: Option<ResearchResult>,
    },

    #[error("{0}")]
    Fatal(String),
}

impl AgentError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn recoverable(message: impl Into<String>, partial: Option<ResearchResult>) -> Self {
        Self::Recoverable {
            message: message.into(),
            partial,
        }
    }
}

impl From<NavigationError> for AgentError {
    fn from(err: NavigationError) -> Self {
        if err.is_recoverable() {
            AgentError::recoverable(err.to_string(), None)
        } else {
            AgentError::Fatal(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task parameters: {0}")]
    InvalidParams(#[from] ParamsError),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("no event channel for task {0}")]
    UnknownTask(TaskId),

    #[error("event channel for task {0} is closed")]
    Closed(TaskId),

    #[error("publish to task {task_id} timed out after {waited:?}")]
    Timeout { task_id: TaskId, waited: Duration },
}
