//! Serialized injection of sub-task outcomes into the parent conversation.
//!
//! A strict-FIFO queue with a non-reentrant processor: one injection streams
//! at a time, under the chat lock, so its SSE event sequence never
//! interleaves with another injection or a user turn. Failures inside a
//! single injection are logged and never affect the originating task.

use crate::agent::{Agent, StreamEvent};
use crate::bus::{BusEvent, EventBus};
use crate::chat_lock::ChatLock;
use crate::history::ChatHistory;
use crate::runner::task::Task;
use anyhow::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionKind {
    TaskResult,
    TaskFailed,
    TaskCancelled,
    ChatResult,
    ChatFailed,
}

impl InjectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionKind::TaskResult => "task_result",
            InjectionKind::TaskFailed => "task_failed",
            InjectionKind::TaskCancelled => "task_cancelled",
            InjectionKind::ChatResult => "chat_result",
            InjectionKind::ChatFailed => "chat_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionMeta {
    pub task_id: String,
    pub kind: InjectionKind,
}

#[derive(Debug, Clone)]
pub struct InjectionItem {
    pub message: String,
    pub meta: InjectionMeta,
}

impl InjectionItem {
    pub fn task_completed(task: &Task, truncate_chars: usize) -> Self {
        let result = task.result.as_deref().unwrap_or("");
        Self {
            message: format!(
                "[子任务完成] taskId={}, agent={}\n描述: {}\n交付物:\n{}",
                task.id,
                task.template_id,
                task.description,
                truncate_with_notice(result, truncate_chars),
            ),
            meta: InjectionMeta {
                task_id: task.id.clone(),
                kind: InjectionKind::TaskResult,
            },
        }
    }

    pub fn task_failed(task: &Task) -> Self {
        let error = task.error.as_deref().unwrap_or("unknown error");
        Self {
            message: format!(
                "[子任务失败] taskId={}, agent={}\n描述: {}\n错误: {}",
                task.id, task.template_id, task.description, error,
            ),
            meta: InjectionMeta {
                task_id: task.id.clone(),
                kind: InjectionKind::TaskFailed,
            },
        }
    }

    pub fn task_cancelled(task: &Task) -> Self {
        let reason = task
            .cancel_reason
            .as_deref()
            .unwrap_or("cancelled by orchestrator");
        Self {
            message: format!(
                "[子任务取消] taskId={}, agent={}\n描述: {}\n原因: {}",
                task.id, task.template_id, task.description, reason,
            ),
            meta: InjectionMeta {
                task_id: task.id.clone(),
                kind: InjectionKind::TaskCancelled,
            },
        }
    }

    pub fn chat_result(task: &Task, reply: &str, truncate_chars: usize) -> Self {
        Self {
            message: format!(
                "[子任务对话回复] taskId={}, agent={}\n描述: {}\n回复:\n{}",
                task.id,
                task.template_id,
                task.description,
                truncate_with_notice(reply, truncate_chars),
            ),
            meta: InjectionMeta {
                task_id: task.id.clone(),
                kind: InjectionKind::ChatResult,
            },
        }
    }

    pub fn chat_failed(task: &Task, error: &str) -> Self {
        Self {
            message: format!(
                "[子任务对话失败] taskId={}, agent={}\n错误: {}",
                task.id, task.template_id, error,
            ),
            meta: InjectionMeta {
                task_id: task.id.clone(),
                kind: InjectionKind::ChatFailed,
            },
        }
    }
}

/// Cap `text` at `max_chars`, appending a notice that points readers at the
/// task snapshot endpoints for the full output.
fn truncate_with_notice(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(&format!(
        "\n[已截断: 完整结果共 {total} 字符, 可通过 bg-tasks 接口获取]"
    ));
    out
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<InjectionItem>,
    processing: bool,
}

struct Shared {
    parent: Arc<dyn Agent>,
    bus: Arc<EventBus>,
    lock: Arc<ChatLock>,
    history: Arc<ChatHistory>,
    state: Mutex<QueueState>,
}

/// FIFO feeder of sub-task outcomes into the parent agent's streaming
/// conversation.
pub struct InjectionQueue {
    shared: Arc<Shared>,
}

impl InjectionQueue {
    pub fn new(
        parent: Arc<dyn Agent>,
        bus: Arc<EventBus>,
        lock: Arc<ChatLock>,
        history: Arc<ChatHistory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                parent,
                bus,
                lock,
                history,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Append an item and kick the processor if it is not already draining.
    pub fn enqueue(&self, item: InjectionItem) {
        debug!(
            "injection enqueued: task={} kind={}",
            item.meta.task_id,
            item.meta.kind.as_str()
        );
        let start_processor = {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state.queue.push_back(item);
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };
        if start_processor {
            tokio::spawn(drive(Arc::clone(&self.shared)));
        }
    }

    /// Number of items waiting behind the one currently streaming.
    pub fn depth(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .queue
            .len()
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        let item = {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match state.queue.pop_front() {
                Some(item) => item,
                None => {
                    state.processing = false;
                    return;
                }
            }
        };

        let _guard = shared.lock.acquire().await;
        if let Err(e) = inject_and_stream(&shared, &item).await {
            warn!(
                "injection for task {} failed: {}",
                item.meta.task_id, e
            );
        }
    }
}

async fn inject_and_stream(shared: &Shared, item: &InjectionItem) -> Result<()> {
    shared.bus.send(BusEvent::OrchestratorStart {
        task_id: item.meta.task_id.clone(),
        reason: item.meta.kind.as_str().to_string(),
    });

    let mut rx = shared.parent.chat_stream(&item.message).await?;
    let mut reaction = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextChunk { delta } => {
                reaction.push_str(&delta);
                shared.bus.send(BusEvent::OrchestratorText { delta });
            }
            StreamEvent::ThinkChunk { delta } => {
                shared.bus.send(BusEvent::Thinking { delta });
            }
            StreamEvent::ToolStart { call } => {
                shared.bus.send(BusEvent::ToolStart { call });
            }
            StreamEvent::ToolEnd { call } => {
                shared.bus.send(BusEvent::ToolEnd { call });
            }
            StreamEvent::ToolError { call, error } => {
                shared.bus.send(BusEvent::ToolError { call, error });
            }
            StreamEvent::Done { .. } => break,
            StreamEvent::TextChunkStart | StreamEvent::ThinkChunkStart => {}
        }
    }

    if !reaction.is_empty() {
        shared.history.push_assistant(reaction);
    }
    shared.bus.send(BusEvent::OrchestratorDone {
        task_id: item.meta.task_id.clone(),
    });
    Ok(())
}
