//! The scheduler's unit of work.

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Dispatch rank: all high precede all normal precede all low.
    pub fn dispatch_rank(self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

/// Per-task resource caps. Unset fields fall back to the scheduler defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub max_tool_calls: Option<u32>,
    pub max_steps: Option<u32>,
    pub idle_timeout_ms: Option<u64>,
}

/// Observed consumption. Strictly non-decreasing.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub tool_calls: u32,
    pub steps: u32,
    pub total_tokens: u64,
}

/// Dispatch options accepted by `BgTaskRunner::start`.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: TaskPriority,
    pub limits: ResourceLimits,
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub template_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub prompt: String,
    pub skills: Vec<String>,
    pub retry_count: u32,
    pub redo_history: Vec<String>,
    pub resource_limits: ResourceLimits,
    pub resource_usage: ResourceUsage,
    /// Epoch ms; set when the task leaves the queue.
    pub start_time: Option<i64>,
    /// Epoch ms; updated on every monitored sub-agent event.
    pub last_activity_time: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub sandbox_url: Option<String>,
    pub sandbox_alive: bool,
    pub agent_alive: bool,
    /// True while a post-completion chat re-entry is streaming. The task
    /// stays `completed` for the duration.
    pub chat_in_flight: bool,
}

impl Task {
    pub(crate) fn new(
        id: String,
        template_id: &str,
        prompt: &str,
        description: &str,
        opts: &TaskOptions,
    ) -> Self {
        Self {
            id,
            template_id: template_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Queued,
            priority: opts.priority,
            prompt: prompt.to_string(),
            skills: opts.skills.clone(),
            retry_count: 0,
            redo_history: Vec::new(),
            resource_limits: opts.limits,
            resource_usage: ResourceUsage::default(),
            start_time: None,
            last_activity_time: Utc::now().timestamp_millis(),
            result: None,
            error: None,
            cancel_reason: None,
            sandbox_url: None,
            sandbox_alive: false,
            agent_alive: false,
            chat_in_flight: false,
        }
    }
}
