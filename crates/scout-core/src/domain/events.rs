//! Progress events produced while a task runs.
//!
//! Wire names follow the `agent:*` convention used by the streaming API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::outcome::Citation;
use super::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEventKind {
    #[serde(rename = "agent:status")]
    Status { status: TaskStatus },

    #[serde(rename = "agent:thinking")]
    Thinking { content: String },

    #[serde(rename = "agent:tool_call")]
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },

    #[serde(rename = "agent:tool_result")]
    ToolResult {
        tool: String,
        output: serde_json::Value,
        success: bool,
    },

    /// A navigation passed the gate and the page was fetched.
    #[serde(rename = "agent:navigation")]
    Navigation {
        url: String,
        #[serde(rename = "waitedMs")]
        waited_ms: u64,
    },

    /// A navigation was refused (domain filter, scope, page budget).
    #[serde(rename = "agent:blocked")]
    Blocked { url: String, reason: String },

    /// A host signalled overload; the task backs off before retrying.
    #[serde(rename = "agent:rate_limited")]
    RateLimited {
        host: String,
        #[serde(rename = "waitMs")]
        wait_ms: u64,
        consecutive: u32,
    },

    #[serde(rename = "agent:screenshot")]
    Screenshot {
        #[serde(rename = "imageUrl")]
        image_url: String,
        #[serde(rename = "fullPage")]
        full_page: bool,
    },

    #[serde(rename = "agent:complete")]
    Complete {
        answer: String,
        citations: Vec<Citation>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },

    #[serde(rename = "agent:error")]
    Error { error: String, recoverable: bool },
}

impl TaskEventKind {
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking {
            content: content.into(),
        }
    }

    pub fn tool_call(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self::ToolCall {
            tool: tool.into(),
            args,
        }
    }

    pub fn tool_result(tool: impl Into<String>, output: serde_json::Value, success: bool) -> Self {
        Self::ToolResult {
            tool: tool.into(),
            output,
            success,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "agent:status",
            Self::Thinking { .. } => "agent:thinking",
            Self::ToolCall { .. } => "agent:tool_call",
            Self::ToolResult { .. } => "agent:tool_result",
            Self::Navigation { .. } => "agent:navigation",
            Self::Blocked { .. } => "agent:blocked",
            Self::RateLimited { .. } => "agent:rate_limited",
            Self::Screenshot { .. } => "agent:screenshot",
            Self::Complete { .. } => "agent:complete",
            Self::Error { .. } => "agent:error",
        }
    }
}

/// One entry of a task's timeline.
///
/// `seq` is assigned by the task that owns the timeline and increases by one per
/// event; subscribers can use it to detect gaps after a resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub seq: u64,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        match &self.kind {
            TaskEventKind::Complete { .. } => true,
            TaskEventKind::Status { status } => status.is_terminal(),
            _ => false,
        }
    }
}
