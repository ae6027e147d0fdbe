//! ResearchAgent port - the external reasoning loop (task body).
//!
//! The agent decides which pages to visit and how to answer. The core only hands it
//! a `TaskContext`, whose `navigate` and `emit` are the agent's sole ways to reach
//! the web and the observers.

use async_trait::async_trait;

use crate::domain::{ResearchParams, ResearchResult, TaskId};
use crate::error::AgentError;
use crate::scheduler::TaskContext;

/// Immutable inputs of one run.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub task_id: TaskId,
    pub question: String,
    pub params: ResearchParams,
}

#[async_trait]
pub trait ResearchAgent: Send + Sync {
    async fn run(
        &self,
        request: ResearchRequest,
        ctx: TaskContext,
    ) -> Result<ResearchResult, AgentError>;
}
