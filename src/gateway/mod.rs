//! HTTP API server for the orchestration core.
//!
//! Thin boundary: every endpoint authenticates, validates, and dispatches to
//! the core components. Chat input that is not a slash command upgrades to
//! an SSE response streaming the orchestrator's turn under the chat lock;
//! `/api/events` serves the broadcast bus. All errors map to structured
//! JSON with 400/401/404/500 codes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentFactory, PermissionDecision, StreamEvent};
use crate::approval::ApprovalManager;
use crate::bus::{BusEvent, EventBus};
use crate::chat_lock::ChatLock;
use crate::commands::{HELP_TEXT, ParsedInput, SlashCommand, parse_input};
use crate::config::Config;
use crate::errors::{ConductorError, ConductorResult};
use crate::history::ChatHistory;
use crate::inject::InjectionQueue;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::runner::{BgTaskRunner, RunnerDeps, RunnerSettings};
use crate::safety::SafeCommandPolicy;
use crate::sandbox::{SandboxFactory, SandboxRegistry};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub runner: BgTaskRunner,
    pub parent: Arc<dyn Agent>,
    pub chat_lock: Arc<ChatLock>,
    pub bus: Arc<EventBus>,
    pub approvals: Arc<ApprovalManager>,
    pub progress: Arc<ProgressTracker>,
    pub history: Arc<ChatHistory>,
    pub injector: Arc<InjectionQueue>,
    auth_token: String,
}

impl AppState {
    /// Wire the full component graph. Leaf components first, then the
    /// runner, then the injection queue — which is handed back to the
    /// runner through its setter to break the agent/runner/queue cycle.
    pub fn assemble(
        config: &Config,
        parent: Arc<dyn Agent>,
        agents: Arc<dyn AgentFactory>,
        sandboxes: Arc<dyn SandboxFactory>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let chat_lock = Arc::new(ChatLock::new());
        let history = Arc::new(ChatHistory::new());
        let approvals = Arc::new(ApprovalManager::new());
        let registry = Arc::new(SandboxRegistry::new());
        let policy = Arc::new(SafeCommandPolicy::new(&config.safety)?);

        let sink_bus = Arc::clone(&bus);
        let sink: ProgressSink = Arc::new(move |record| {
            sink_bus.send(BusEvent::Progress {
                task_id: record.task_id,
                percent: record.percent,
                stage: record.stage,
                message: record.message,
            });
        });
        let progress = Arc::new(ProgressTracker::new(
            Duration::from_millis(config.progress.interval_ms),
            sink,
        ));

        let runner = BgTaskRunner::new(
            RunnerSettings::from_config(config),
            RunnerDeps {
                agents,
                sandboxes,
                registry,
                bus: Arc::clone(&bus),
                progress: Arc::clone(&progress),
                approvals: Arc::clone(&approvals),
                policy,
            },
        );

        let injector = Arc::new(InjectionQueue::new(
            Arc::clone(&parent),
            Arc::clone(&bus),
            Arc::clone(&chat_lock),
            Arc::clone(&history),
        ));
        runner.set_injector(Arc::clone(&injector));

        let auth_token = match &config.gateway.auth_token {
            Some(token) => token.clone(),
            None => {
                let token = Uuid::new_v4().to_string();
                info!("no auth token configured; generated one: {}", token);
                token
            }
        };

        Ok(Self {
            runner,
            parent,
            chat_lock,
            bus,
            approvals,
            progress,
            history,
            injector,
            auth_token,
        })
    }
}

/// JSON error wrapper implementing the status-code mapping.
pub struct ApiError(ConductorError);

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error at gateway: {}", self.0);
        }
        (status, axum::Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/command", post(command_handler))
        .route("/api/events", get(events_handler))
        .route("/api/status", get(status_handler))
        .route("/api/history", get(history_handler))
        .route("/api/approval", post(approval_handler))
        .route("/api/sandbox/dispose", post(sandbox_dispose_handler))
        .route("/api/bg-tasks", get(bg_tasks_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the task is aborted or the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ----------------------------------------------------------------------
// Auth
// ----------------------------------------------------------------------

fn authorize(state: &AppState, headers: &HeaderMap) -> ConductorResult<()> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ConductorError::Auth("missing bearer token".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ConductorError::Auth("malformed authorization header".into()))?;
    verify_token(state, token)
}

fn verify_token(state: &AppState, token: &str) -> ConductorResult<()> {
    if token.as_bytes().ct_eq(state.auth_token.as_bytes()).into() {
        Ok(())
    } else {
        Err(ConductorError::Auth("invalid token".into()))
    }
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

fn body_str<'a>(body: &'a serde_json::Value, field: &str) -> ConductorResult<&'a str> {
    body.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ConductorError::Validation(format!("missing field '{field}'")))
}

/// POST /api/chat — slash commands answer in JSON; anything else upgrades to
/// an SSE stream of the orchestrator's turn.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let message = body_str(&body, "message")?;

    match parse_input(message)? {
        ParsedInput::Command(command) => {
            let result = dispatch_command(&state, command)?;
            Ok(axum::Json(result).into_response())
        }
        ParsedInput::Chat(text) => Ok(stream_user_turn(state, text).into_response()),
    }
}

/// Stream a user-initiated orchestrator turn. The chat lock is acquired
/// inside the stream so the turn interleaves fairly with injections.
fn stream_user_turn(
    state: AppState,
    message: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.history.push_user(&message);

    let stream = async_stream::stream! {
        let _guard = state.chat_lock.acquire().await;
        let mut rx = match state.parent.chat_stream(&message).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("orchestrator turn failed to start: {}", e);
                yield Ok(sse_event(&BusEvent::Error { message: e.to_string() }));
                return;
            }
        };

        let mut reply = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextChunk { delta } => {
                    reply.push_str(&delta);
                    yield Ok(sse_event(&BusEvent::Text { delta }));
                }
                StreamEvent::ThinkChunk { delta } => {
                    yield Ok(sse_event(&BusEvent::Thinking { delta }));
                }
                StreamEvent::ToolStart { call } => {
                    yield Ok(sse_event(&BusEvent::ToolStart { call }));
                }
                StreamEvent::ToolEnd { call } => {
                    yield Ok(sse_event(&BusEvent::ToolEnd { call }));
                }
                StreamEvent::ToolError { call, error } => {
                    yield Ok(sse_event(&BusEvent::ToolError { call, error }));
                }
                StreamEvent::Done { reason } => {
                    yield Ok(sse_event(&BusEvent::Done { reason }));
                    break;
                }
                StreamEvent::TextChunkStart | StreamEvent::ThinkChunkStart => {}
            }
        }
        if !reply.is_empty() {
            state.history.push_assistant(reply);
        }
    };
    Sse::new(stream)
}

/// POST /api/command — slash commands only.
async fn command_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let command = body_str(&body, "command")?;
    match parse_input(command)? {
        ParsedInput::Command(parsed) => Ok(axum::Json(dispatch_command(&state, parsed)?)),
        ParsedInput::Chat(_) => Err(ConductorError::Validation(
            "not a command; use /api/chat for free-form messages".into(),
        )
        .into()),
    }
}

fn dispatch_command(
    state: &AppState,
    command: SlashCommand,
) -> ConductorResult<serde_json::Value> {
    match command {
        SlashCommand::Confirm { permission_id } => {
            decide_approval(state, &permission_id, PermissionDecision::Allow, None)
        }
        SlashCommand::Cancel { permission_id } => {
            decide_approval(state, &permission_id, PermissionDecision::Deny, None)
        }
        SlashCommand::Status => Ok(status_snapshot(state)),
        SlashCommand::History { limit } => {
            let entries = state.history.recent(limit.unwrap_or(50));
            Ok(json!({ "history": entries }))
        }
        SlashCommand::Help => Ok(json!({ "help": HELP_TEXT })),
    }
}

fn decide_approval(
    state: &AppState,
    permission_id: &str,
    decision: PermissionDecision,
    note: Option<String>,
) -> ConductorResult<serde_json::Value> {
    if state.approvals.decide(permission_id, decision, note) {
        Ok(json!({ "ok": true, "permissionId": permission_id, "decision": decision }))
    } else {
        Err(ConductorError::NotFound(format!(
            "permission {permission_id}"
        )))
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    token: Option<String>,
}

/// GET /api/events?token=… — the SSE bus. Query-param auth because
/// EventSource cannot set headers.
async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let token = query
        .token
        .ok_or_else(|| ConductorError::Auth("missing token".into()))?;
    verify_token(&state, &token)?;

    let mut rx = state.bus.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => yield Ok(sse_event(&event)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    yield Ok(sse_event(&BusEvent::Error {
                        message: format!("event stream lagged; {missed} events dropped"),
                    }));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream))
}

/// GET /api/status — snapshot of active tasks, progress, pending approvals.
async fn status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    Ok(axum::Json(status_snapshot(&state)))
}

fn status_snapshot(state: &AppState) -> serde_json::Value {
    json!({
        "activeTasks": state.runner.get_active_tasks(),
        "queuedTasks": state.runner.get_queued_tasks(),
        "progress": state.progress.snapshot(),
        "pendingApprovals": state.approvals.pending(),
    })
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/history — user/assistant transcript.
async fn history_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let entries = state.history.recent(query.limit.unwrap_or(50));
    Ok(axum::Json(json!({ "history": entries })))
}

/// POST /api/approval — resolve a pending tool approval.
async fn approval_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let permission_id = body_str(&body, "permissionId")?;
    let decision = match body_str(&body, "decision")? {
        "allow" => PermissionDecision::Allow,
        "deny" => PermissionDecision::Deny,
        other => {
            return Err(ConductorError::Validation(format!(
                "decision must be 'allow' or 'deny', got '{other}'"
            ))
            .into());
        }
    };
    let note = body
        .get("note")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(axum::Json(decide_approval(
        &state,
        permission_id,
        decision,
        note,
    )?))
}

/// POST /api/sandbox/dispose — early tear-down of a kept-alive sandbox.
async fn sandbox_dispose_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let task_id = body_str(&body, "taskId")?;
    if state.runner.get_task(task_id).is_none() {
        return Err(ConductorError::NotFound(format!("task {task_id}")).into());
    }
    let disposed = state.runner.dispose_sandbox(task_id).await;
    Ok(axum::Json(json!({ "ok": true, "disposed": disposed })))
}

/// GET /api/bg-tasks — every task record, with usage, alive flags, elapsed.
async fn bg_tasks_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let now = chrono::Utc::now().timestamp_millis();
    let tasks: Vec<serde_json::Value> = state
        .runner
        .get_all_tasks()
        .into_iter()
        .map(|task| {
            let elapsed_ms = task.start_time.map(|start| {
                let end = if task.status == crate::runner::task::TaskStatus::Running {
                    now
                } else {
                    task.last_activity_time
                };
                (end - start).max(0)
            });
            let mut value = serde_json::to_value(&task).unwrap_or_else(|_| json!({}));
            if let Some(obj) = value.as_object_mut() {
                obj.insert("elapsedMs".to_string(), json!(elapsed_ms));
            }
            value
        })
        .collect();
    Ok(axum::Json(json!({ "tasks": tasks })))
}

/// GET /api/health — unauthenticated liveness probe.
async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

/// Serialize one bus event as an SSE frame: `data: <JSON>\n\n`.
fn sse_event(event: &BusEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(event) => event,
        Err(e) => {
            warn!("failed to serialize SSE event: {}", e);
            Event::default().data("{}")
        }
    }
}
