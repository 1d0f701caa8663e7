//! Typed broadcast bus feeding connected SSE clients.
//!
//! Delivery is best-effort: there is no per-subscriber buffering, and a slow
//! consumer that falls behind the channel capacity misses events. All
//! critical state is recoverable through the snapshot endpoints, so the bus
//! only ever carries ephemera.

use crate::agent::ToolCall;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Event envelope serialized to clients as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    Text {
        delta: String,
    },
    Thinking {
        delta: String,
    },
    ToolStart {
        call: ToolCall,
    },
    ToolEnd {
        call: ToolCall,
    },
    ToolError {
        call: ToolCall,
        error: String,
    },
    ApprovalNeeded {
        permission_id: String,
        tool: String,
        input_preview: serde_json::Value,
        task_id: Option<String>,
    },
    Progress {
        task_id: String,
        percent: u8,
        stage: String,
        message: Option<String>,
    },
    Phase {
        task_id: String,
        phase: String,
        detail: Option<String>,
    },
    Done {
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    OrchestratorStart {
        task_id: String,
        reason: String,
    },
    OrchestratorText {
        delta: String,
    },
    OrchestratorDone {
        task_id: String,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event to every live subscriber. A send with no
    /// subscribers is not an error; the bus is fire-and-forget.
    pub fn send(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
