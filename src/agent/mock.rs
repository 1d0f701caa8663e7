//! Deterministic agent runtimes for tests and the development binary.
//!
//! `ScriptedAgent` plays back a pre-scripted sequence of turns — including
//! monitor events, pauses, and interrupt-await points — so tests can
//! exercise exact scheduler interleavings without a live LLM runtime.
//! `EchoAgent` is the development fallback: it completes immediately,
//! echoing its input.

use super::{
    Agent, AgentFactory, Completion, MonitorEvent, PermissionRequest, PermissionResponse,
    StreamEvent, ToolCall,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};
use uuid::Uuid;

/// Cloneable description of a monitor event to emit mid-turn.
#[derive(Debug, Clone)]
pub enum MonitorEmit {
    ToolExecuted { call: ToolCall },
    StepComplete,
    TokenUsage { total_tokens: u64 },
    ContextCompression { phase: String },
    PermissionRequired { call: ToolCall },
}

/// What a scripted turn does after emitting its events.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// Return a finished completion with this text.
    Finish(String),
    /// Return a paused completion immediately.
    Pause,
    /// Hang until `interrupt` is called, then return paused.
    AwaitInterrupt,
}

#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub emits: Vec<(Duration, MonitorEmit)>,
    pub outcome: TurnOutcome,
}

impl ScriptedTurn {
    pub fn finish(text: impl Into<String>) -> Self {
        Self {
            emits: Vec::new(),
            outcome: TurnOutcome::Finish(text.into()),
        }
    }

    pub fn pause() -> Self {
        Self {
            emits: Vec::new(),
            outcome: TurnOutcome::Pause,
        }
    }

    /// A turn that produces no events and never finishes on its own — the
    /// shape of a stuck sub-agent.
    pub fn hang() -> Self {
        Self {
            emits: Vec::new(),
            outcome: TurnOutcome::AwaitInterrupt,
        }
    }

    pub fn emit(mut self, after: Duration, event: MonitorEmit) -> Self {
        self.emits.push((after, event));
        self
    }
}

#[derive(Default)]
struct ScriptedState {
    turns: VecDeque<ScriptedTurn>,
    streams: VecDeque<Vec<StreamEvent>>,
}

/// A pre-scripted agent. Each `complete` call pops the next turn; each
/// `chat_stream` call pops the next event script (defaulting to a one-chunk
/// text reply).
pub struct ScriptedAgent {
    state: Mutex<ScriptedState>,
    monitors: Mutex<Vec<mpsc::UnboundedSender<MonitorEvent>>>,
    interrupt: Notify,
    /// Inputs seen by `complete`, in order.
    pub completions: Mutex<Vec<String>>,
    /// Inputs seen by `chat_stream`, in order.
    pub stream_inputs: Mutex<Vec<String>>,
    /// Notes passed to `interrupt`, in order.
    pub interrupts: Mutex<Vec<Option<String>>>,
    /// Responses delivered to emitted permission requests.
    pub permission_log: Arc<Mutex<Vec<PermissionResponse>>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedState {
                turns: turns.into(),
                streams: VecDeque::new(),
            }),
            monitors: Mutex::new(Vec::new()),
            interrupt: Notify::new(),
            completions: Mutex::new(Vec::new()),
            stream_inputs: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            permission_log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Convenience: an agent that always finishes its first turn with `text`.
    pub fn always_text(text: impl Into<String>) -> Arc<Self> {
        Self::new(vec![ScriptedTurn::finish(text)])
    }

    /// Queue an event script for the next `chat_stream` call.
    pub fn push_stream(&self, events: Vec<StreamEvent>) {
        self.state.lock().unwrap().streams.push_back(events);
    }

    /// Queue another turn after construction.
    pub fn push_turn(&self, turn: ScriptedTurn) {
        self.state.lock().unwrap().turns.push_back(turn);
    }

    fn deliver(&self, emit: MonitorEmit) {
        let mut monitors = self.monitors.lock().unwrap();
        monitors.retain(|tx| !tx.is_closed());
        match emit {
            MonitorEmit::PermissionRequired { call } => {
                // Permission requests carry a one-shot responder, so they go
                // to the most recent subscriber only.
                if let Some(tx) = monitors.last() {
                    let (respond, rx) = oneshot::channel();
                    let request = PermissionRequest {
                        id: Uuid::new_v4().to_string(),
                        call,
                        respond,
                    };
                    if tx.send(MonitorEvent::PermissionRequired(request)).is_ok() {
                        let log = Arc::clone(&self.permission_log);
                        tokio::spawn(async move {
                            if let Ok(response) = rx.await {
                                log.lock().unwrap().push(response);
                            }
                        });
                    }
                }
            }
            other => {
                for tx in monitors.iter() {
                    let event = match &other {
                        MonitorEmit::ToolExecuted { call } => MonitorEvent::ToolExecuted {
                            call: call.clone(),
                        },
                        MonitorEmit::StepComplete => MonitorEvent::StepComplete,
                        MonitorEmit::TokenUsage { total_tokens } => MonitorEvent::TokenUsage {
                            total_tokens: *total_tokens,
                        },
                        MonitorEmit::ContextCompression { phase } => {
                            MonitorEvent::ContextCompression {
                                phase: phase.clone(),
                                summary: None,
                            }
                        }
                        MonitorEmit::PermissionRequired { .. } => unreachable!(),
                    };
                    let _ = tx.send(event);
                }
            }
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn complete(&self, input: &str) -> Result<Completion> {
        self.completions.lock().unwrap().push(input.to_string());
        let turn = self.state.lock().unwrap().turns.pop_front();
        let Some(turn) = turn else {
            return Ok(Completion::finished("done"));
        };

        for (after, emit) in turn.emits {
            tokio::select! {
                () = tokio::time::sleep(after) => self.deliver(emit),
                () = self.interrupt.notified() => return Ok(Completion::paused()),
            }
        }

        match turn.outcome {
            TurnOutcome::Finish(text) => Ok(Completion::finished(text)),
            TurnOutcome::Pause => Ok(Completion::paused()),
            TurnOutcome::AwaitInterrupt => {
                self.interrupt.notified().await;
                Ok(Completion::paused())
            }
        }
    }

    async fn chat_stream(&self, input: &str) -> Result<mpsc::Receiver<StreamEvent>> {
        self.stream_inputs.lock().unwrap().push(input.to_string());
        let events = self
            .state
            .lock()
            .unwrap()
            .streams
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    StreamEvent::TextChunkStart,
                    StreamEvent::TextChunk {
                        delta: "ok".to_string(),
                    },
                    StreamEvent::Done { reason: None },
                ]
            });
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn interrupt(&self, note: Option<&str>) {
        self.interrupts
            .lock()
            .unwrap()
            .push(note.map(str::to_string));
        self.interrupt.notify_one();
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.lock().unwrap().push(tx);
        rx
    }
}

/// Hands out pre-built scripted agents in order. `create` fails when the
/// queue is exhausted, which makes an unexpected extra dispatch loud.
pub struct ScriptedAgentFactory {
    agents: Mutex<VecDeque<Arc<ScriptedAgent>>>,
    /// `(template_id, skills)` for every `create` call.
    pub created: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedAgentFactory {
    pub fn new(agents: Vec<Arc<ScriptedAgent>>) -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(agents.into()),
            created: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AgentFactory for ScriptedAgentFactory {
    async fn create(&self, template_id: &str, skills: &[String]) -> Result<Arc<dyn Agent>> {
        self.created
            .lock()
            .unwrap()
            .push((template_id.to_string(), skills.to_vec()));
        let agent = self.agents.lock().unwrap().pop_front();
        agent
            .map(|a| a as Arc<dyn Agent>)
            .ok_or_else(|| anyhow::anyhow!("scripted agent queue exhausted"))
    }
}

/// Development runtime: completes immediately, echoing the input tail.
pub struct EchoAgent {
    // Held so monitor subscriptions stay open for the agent's lifetime.
    monitors: Mutex<Vec<mpsc::UnboundedSender<MonitorEvent>>>,
}

impl EchoAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            monitors: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn complete(&self, input: &str) -> Result<Completion> {
        let tail: String = input.lines().last().unwrap_or("").chars().take(200).collect();
        Ok(Completion::finished(format!("echo: {tail}")))
    }

    async fn chat_stream(&self, input: &str) -> Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(8);
        let tail: String = input.chars().take(200).collect();
        tokio::spawn(async move {
            let _ = tx.send(StreamEvent::TextChunkStart).await;
            let _ = tx
                .send(StreamEvent::TextChunk {
                    delta: format!("echo: {tail}"),
                })
                .await;
            let _ = tx.send(StreamEvent::Done { reason: None }).await;
        });
        Ok(rx)
    }

    async fn interrupt(&self, _note: Option<&str>) {}

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitors.lock().unwrap().push(tx);
        rx
    }
}

/// Factory that builds a fresh `EchoAgent` per dispatch.
pub struct EchoAgentFactory;

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn create(&self, _template_id: &str, _skills: &[String]) -> Result<Arc<dyn Agent>> {
        Ok(EchoAgent::new() as Arc<dyn Agent>)
    }
}
