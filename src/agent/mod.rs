//! Contract for the external agent runtime.
//!
//! The LLM runtime that actually executes prompts is an external
//! collaborator: conductor only schedules it, watches its monitor events,
//! and streams its output. Everything here is interface — the shipped
//! [`mock`] module provides scripted implementations for tests and the dev
//! binary.

pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Outcome of a single `complete` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// The turn ran to a final answer.
    Ok,
    /// The turn stopped at a safe point after an interrupt request.
    Paused,
}

/// Result of `Agent::complete`. `text` is present iff the turn finished.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: CompletionStatus,
    pub text: Option<String>,
}

impl Completion {
    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Ok,
            text: Some(text.into()),
        }
    }

    pub fn paused() -> Self {
        Self {
            status: CompletionStatus::Paused,
            text: None,
        }
    }
}

/// A tool invocation as reported by the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Event stream produced by `Agent::chat_stream`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextChunkStart,
    TextChunk { delta: String },
    ThinkChunkStart,
    ThinkChunk { delta: String },
    ToolStart { call: ToolCall },
    ToolEnd { call: ToolCall },
    ToolError { call: ToolCall, error: String },
    Done { reason: Option<String> },
}

/// Decision delivered back to a waiting `permission_required` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

#[derive(Debug)]
pub struct PermissionResponse {
    pub decision: PermissionDecision,
    /// Audit note recorded with the decision (e.g. who/why auto-allowed).
    pub note: Option<String>,
}

/// A pending permission request. The holder of `respond` decides the call's
/// fate; dropping it without responding reads as a denial to the runtime.
#[derive(Debug)]
pub struct PermissionRequest {
    pub id: String,
    pub call: ToolCall,
    pub respond: oneshot::Sender<PermissionResponse>,
}

/// Monitor-channel events emitted by a running sub-agent.
#[derive(Debug)]
pub enum MonitorEvent {
    PermissionRequired(PermissionRequest),
    ToolExecuted {
        call: ToolCall,
    },
    StepComplete,
    TokenUsage {
        total_tokens: u64,
    },
    ContextCompression {
        phase: String,
        summary: Option<String>,
    },
}

/// Black-box agent runtime contract (consumed, not implemented here).
#[async_trait]
pub trait Agent: Send + Sync {
    /// Single-shot completion that may pause at a safe point after an
    /// `interrupt` request.
    async fn complete(&self, input: &str) -> Result<Completion>;

    /// Streaming variant used for the orchestrator's conversational turns.
    async fn chat_stream(&self, input: &str) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Request a pause at the next safe point. Best-effort.
    async fn interrupt(&self, note: Option<&str>);

    /// Subscribe to the monitor channel. Each call returns an independent
    /// receiver; events are delivered in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent>;
}

/// Creates sub-agent instances from a template id plus knowledge packs.
/// Templates (prompt text, tool allowlists) live in the external runtime
/// and are opaque to the scheduler.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self, template_id: &str, skills: &[String]) -> Result<Arc<dyn Agent>>;
}
