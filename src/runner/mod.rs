//! Background sub-task runner: priority dispatch, per-task resource
//! governance, agent lifecycle, and result injection back into the parent
//! conversation.
//!
//! The runner owns every task record for the process lifetime (history stays
//! observable), owns sub-agent instances and sandboxes while they are live,
//! and hands ownership to keep-alive timers after a successful completion.
//! Per-task failures never escape as errors: they become the task's `error`
//! field and a `task_failed` injection.

pub mod permission;
pub mod task;

use crate::agent::{Agent, AgentFactory, CompletionStatus, MonitorEvent};
use crate::approval::ApprovalManager;
use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::inject::{InjectionItem, InjectionQueue};
use crate::progress::ProgressTracker;
use crate::safety::SafeCommandPolicy;
use crate::sandbox::{SandboxFactory, SandboxKind, SandboxRegistry};
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use task::{Task, TaskOptions, TaskStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Matches a published preview marker in a sub-agent's final text.
static PREVIEW_MARKER: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"\[sandbox-preview\]\(([^)\s]+)\)").expect("preview marker regex must compile")
});

/// Scheduler knobs, resolved from [`Config`] at assembly time.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_concurrent: usize,
    pub default_idle_timeout_ms: u64,
    pub default_max_tool_calls: u32,
    pub default_max_steps: u32,
    pub agent_keep_alive_ms: u64,
    pub sandbox_keep_alive_ms: u64,
    pub result_truncate_chars: usize,
    pub redo_truncate_chars: usize,
    pub shell_tool: String,
    pub default_sandbox_kind: SandboxKind,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.scheduler.max_concurrent,
            default_idle_timeout_ms: config.scheduler.default_idle_timeout_ms,
            default_max_tool_calls: config.scheduler.default_max_tool_calls,
            default_max_steps: config.scheduler.default_max_steps,
            agent_keep_alive_ms: config.keep_alive.agent_ms,
            sandbox_keep_alive_ms: config.keep_alive.sandbox_ms,
            result_truncate_chars: config.injection.result_truncate_chars,
            redo_truncate_chars: config.injection.redo_truncate_chars,
            shell_tool: config.safety.shell_tool.clone(),
            default_sandbox_kind: SandboxKind::Local,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators the runner is wired to at construction (§ construction
/// order: the injection queue arrives later through `set_injector`).
pub struct RunnerDeps {
    pub agents: Arc<dyn AgentFactory>,
    pub sandboxes: Arc<dyn SandboxFactory>,
    pub registry: Arc<SandboxRegistry>,
    pub bus: Arc<EventBus>,
    pub progress: Arc<ProgressTracker>,
    pub approvals: Arc<ApprovalManager>,
    pub policy: Arc<SafeCommandPolicy>,
}

/// Outcome of `chat_async`: whether the background chat was launched.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatStart {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatStart {
    fn launched() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

struct PendingRef {
    id: String,
    rank: u8,
}

#[derive(Default)]
struct RunnerState {
    tasks: HashMap<String, Task>,
    /// Dispatch order of every task ever created (snapshot ordering).
    order: Vec<String>,
    /// Queued task refs, kept sorted by dispatch rank (stable within rank).
    pending: Vec<PendingRef>,
    live_agents: HashMap<String, Arc<dyn Agent>>,
    /// Next input stashed by `send_message`, consumed by the pause-loop.
    stashed_inputs: HashMap<String, String>,
    agent_timers: HashMap<String, JoinHandle<()>>,
    sandbox_timers: HashMap<String, JoinHandle<()>>,
}

struct RunnerInner {
    settings: RunnerSettings,
    agents: Arc<dyn AgentFactory>,
    sandboxes: Arc<dyn SandboxFactory>,
    registry: Arc<SandboxRegistry>,
    bus: Arc<EventBus>,
    progress: Arc<ProgressTracker>,
    approvals: Arc<ApprovalManager>,
    policy: Arc<SafeCommandPolicy>,
    injector: OnceLock<Arc<InjectionQueue>>,
    state: Mutex<RunnerState>,
}

impl RunnerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunnerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct BgTaskRunner {
    inner: Arc<RunnerInner>,
}

enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl BgTaskRunner {
    pub fn new(settings: RunnerSettings, deps: RunnerDeps) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                settings,
                agents: deps.agents,
                sandboxes: deps.sandboxes,
                registry: deps.registry,
                bus: deps.bus,
                progress: deps.progress,
                approvals: deps.approvals,
                policy: deps.policy,
                injector: OnceLock::new(),
                state: Mutex::new(RunnerState::default()),
            }),
        }
    }

    /// Wire the injection queue after construction. The queue holds the
    /// parent agent, the parent invokes the runner through its tools; this
    /// setter breaks that cycle.
    pub fn set_injector(&self, injector: Arc<InjectionQueue>) {
        if self.inner.injector.set(injector).is_err() {
            warn!("injection queue was already wired; ignoring");
        }
    }

    // ------------------------------------------------------------------
    // Public contract
    // ------------------------------------------------------------------

    /// Enqueue a task and kick the dispatcher. Returns immediately with the
    /// new id; never blocks on running capacity.
    pub fn start(
        &self,
        template_id: &str,
        prompt: &str,
        description: &str,
        opts: TaskOptions,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let task = Task::new(id.clone(), template_id, prompt, description, &opts);
        info!(
            "task [{}] queued: template={} priority={:?}",
            short(&id),
            template_id,
            task.priority
        );
        self.enqueue_task(task);
        self.drain();
        id
    }

    /// Cancel a queued or running task. Queued tasks never start; running
    /// tasks are asked to interrupt and the pause-loop observes the
    /// cancelled state. Returns false for terminal (or unknown) tasks.
    pub async fn cancel(&self, task_id: &str, reason: Option<&str>) -> bool {
        enum Action {
            Queued(Task),
            Running(Option<Arc<dyn Agent>>),
            Ineligible,
        }

        let action = {
            let mut state = self.inner.lock();
            let Some(task) = state.tasks.get_mut(task_id) else {
                return false;
            };
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Cancelled;
                    task.cancel_reason = reason.map(str::to_string);
                    let snapshot = task.clone();
                    state.pending.retain(|p| p.id != task_id);
                    Action::Queued(snapshot)
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    task.cancel_reason = reason.map(str::to_string);
                    Action::Running(state.live_agents.get(task_id).cloned())
                }
                _ => Action::Ineligible,
            }
        };

        match action {
            Action::Queued(task) => {
                info!("task [{}] cancelled while queued", short(task_id));
                self.emit_status(&task);
                self.enqueue_injection(InjectionItem::task_cancelled(&task));
                true
            }
            Action::Running(agent) => {
                info!("task [{}] cancel requested while running", short(task_id));
                if let Some(task) = self.get_task(task_id) {
                    self.emit_status(&task);
                }
                if let Some(agent) = agent {
                    agent
                        .interrupt(Some(reason.unwrap_or("cancelled by orchestrator")))
                        .await;
                }
                true
            }
            Action::Ineligible => false,
        }
    }

    /// Stash the next input for a running task and interrupt its current
    /// turn; the pause-loop refuels with the new instruction.
    pub async fn send_message(&self, task_id: &str, instruction: &str) -> bool {
        let agent = {
            let mut state = self.inner.lock();
            match state.tasks.get(task_id) {
                Some(task) if task.status == TaskStatus::Running => {
                    state
                        .stashed_inputs
                        .insert(task_id.to_string(), instruction.to_string());
                    state.live_agents.get(task_id).cloned()
                }
                _ => return false,
            }
        };
        match agent {
            Some(agent) => {
                debug!("task [{}] steering instruction stashed", short(task_id));
                agent.interrupt(Some("new instruction queued")).await;
                true
            }
            None => {
                self.inner.lock().stashed_inputs.remove(task_id);
                false
            }
        }
    }

    /// Launch a background chat re-entry against a kept-alive sub-agent.
    /// Eventually enqueues a `chat_result` or `chat_failed` injection.
    pub fn chat_async(&self, task_id: &str, message: &str) -> ChatStart {
        let agent = {
            let mut state = self.inner.lock();
            {
                let Some(task) = state.tasks.get(task_id) else {
                    return ChatStart::rejected(format!("unknown task: {task_id}"));
                };
                if !task.agent_alive {
                    return ChatStart::rejected(format!(
                        "task is {}, its agent is no longer alive",
                        task.status.as_str()
                    ));
                }
                if task.chat_in_flight {
                    return ChatStart::rejected("a chat with this task is already in flight");
                }
            }
            let Some(agent) = state.live_agents.get(task_id).cloned() else {
                return ChatStart::rejected("agent instance is gone");
            };
            state.tasks.get_mut(task_id).unwrap().chat_in_flight = true;
            // Extend the keep-alive window for the duration of the chat.
            if let Some(timer) = state.agent_timers.remove(task_id) {
                timer.abort();
            }
            agent
        };

        let runner = self.clone();
        let id = task_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move {
            runner.run_chat(id, agent, message).await;
        });
        ChatStart::launched()
    }

    /// Idempotent sandbox tear-down. Returns true when a live sandbox was
    /// actually disposed.
    pub async fn dispose_sandbox(&self, task_id: &str) -> bool {
        let (sandbox, timer) = {
            let mut state = self.inner.lock();
            let timer = state.sandbox_timers.remove(task_id);
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.sandbox_alive = false;
            }
            (self.inner.registry.remove(task_id), timer)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        match sandbox {
            Some(sandbox) => {
                if let Err(e) = sandbox.dispose().await {
                    // Disposal is best-effort; the registry entry is gone
                    // either way.
                    warn!("sandbox disposal failed for task [{}]: {}", short(task_id), e);
                }
                debug!("sandbox disposed for task [{}]", short(task_id));
                true
            }
            None => false,
        }
    }

    /// Idempotent agent tear-down: ends the keep-alive window.
    pub fn dispose_agent(&self, task_id: &str) {
        let timer = {
            let mut state = self.inner.lock();
            let timer = state.agent_timers.remove(task_id);
            if state.live_agents.remove(task_id).is_some() {
                debug!("agent disposed for task [{}]", short(task_id));
            }
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.agent_alive = false;
            }
            timer
        };
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    /// Re-dispatch a failed or cancelled task as a fresh task with preserved
    /// lineage.
    pub fn retry(
        &self,
        task_id: &str,
        modified_prompt: Option<String>,
    ) -> crate::errors::ConductorResult<String> {
        let task = {
            let state = self.inner.lock();
            let orig = state
                .tasks
                .get(task_id)
                .ok_or_else(|| crate::errors::ConductorError::NotFound(format!("task {task_id}")))?;
            if !matches!(orig.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(crate::errors::ConductorError::State(format!(
                    "task is {}, only failed or cancelled tasks can be retried",
                    orig.status.as_str()
                )));
            }
            let retry_count = orig.retry_count + 1;
            let mut task = Task::new(
                Uuid::new_v4().to_string(),
                &orig.template_id,
                modified_prompt.as_deref().unwrap_or(&orig.prompt),
                &format!("{} (retry #{retry_count})", base_description(&orig.description)),
                &TaskOptions {
                    priority: orig.priority,
                    limits: orig.resource_limits,
                    skills: orig.skills.clone(),
                },
            );
            task.retry_count = retry_count;
            task.redo_history = orig.redo_history.clone();
            task
        };
        let id = task.id.clone();
        info!("task [{}] retried as [{}]", short(task_id), short(&id));
        self.enqueue_task(task);
        self.drain();
        Ok(id)
    }

    /// Re-dispatch a completed task with rejection feedback folded into the
    /// prompt.
    pub fn redo(
        &self,
        task_id: &str,
        feedback: &str,
    ) -> crate::errors::ConductorResult<String> {
        let task = {
            let state = self.inner.lock();
            let orig = state
                .tasks
                .get(task_id)
                .ok_or_else(|| crate::errors::ConductorError::NotFound(format!("task {task_id}")))?;
            if orig.status != TaskStatus::Completed {
                return Err(crate::errors::ConductorError::State(format!(
                    "task is {}, only completed tasks can be redone",
                    orig.status.as_str()
                )));
            }
            let excerpt: String = orig
                .result
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(self.inner.settings.redo_truncate_chars)
                .collect();
            let prompt = format!(
                "{}\n\n[previous result was rejected]\n{}\n\nPrevious result:\n{}",
                orig.prompt,
                feedback.trim(),
                excerpt,
            );
            let mut redo_history = orig.redo_history.clone();
            redo_history.push(feedback.to_string());
            let redo_n = redo_history.len();
            let mut task = Task::new(
                Uuid::new_v4().to_string(),
                &orig.template_id,
                &prompt,
                &format!("{} (redo #{redo_n})", base_description(&orig.description)),
                &TaskOptions {
                    priority: orig.priority,
                    limits: orig.resource_limits,
                    skills: orig.skills.clone(),
                },
            );
            task.retry_count = orig.retry_count;
            task.redo_history = redo_history;
            task
        };
        let id = task.id.clone();
        info!("task [{}] redone as [{}]", short(task_id), short(&id));
        self.enqueue_task(task);
        self.drain();
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Read accessors (snapshots)
    // ------------------------------------------------------------------

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        let state = self.inner.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn get_active_tasks(&self) -> Vec<Task> {
        self.get_all_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect()
    }

    pub fn get_queued_tasks(&self) -> Vec<Task> {
        let state = self.inner.lock();
        state
            .pending
            .iter()
            .filter_map(|p| state.tasks.get(&p.id))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn enqueue_task(&self, task: Task) {
        let snapshot = task.clone();
        {
            let mut state = self.inner.lock();
            state.pending.push(PendingRef {
                id: task.id.clone(),
                rank: task.priority.dispatch_rank(),
            });
            // Stable sort: within a priority, dispatch order equals enqueue
            // order.
            state.pending.sort_by_key(|p| p.rank);
            state.order.push(task.id.clone());
            state.tasks.insert(task.id.clone(), task);
        }
        self.emit_status(&snapshot);
    }

    /// Promote queued tasks into the running set while capacity allows.
    fn drain(&self) {
        let promoted = {
            let mut state = self.inner.lock();
            let mut promoted = Vec::new();
            loop {
                let running = state
                    .tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Running)
                    .count();
                if running >= self.inner.settings.max_concurrent || state.pending.is_empty() {
                    break;
                }
                let next = state.pending.remove(0);
                let Some(task) = state.tasks.get_mut(&next.id) else {
                    continue;
                };
                if task.status != TaskStatus::Queued {
                    continue;
                }
                let now = Utc::now().timestamp_millis();
                task.status = TaskStatus::Running;
                task.start_time = Some(now);
                task.last_activity_time = now;
                promoted.push(task.clone());
            }
            promoted
        };

        for task in promoted {
            info!("task [{}] dispatched", short(&task.id));
            self.emit_status(&task);
            let runner = self.clone();
            let id = task.id.clone();
            tokio::spawn(async move {
                runner.execute(id).await;
            });
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn execute(self, task_id: String) {
        let Some(snapshot) = self.get_task(&task_id) else {
            return;
        };

        // Sub-agent first: without it nothing else can happen.
        let agent = match self
            .inner
            .agents
            .create(&snapshot.template_id, &snapshot.skills)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_task(&task_id, &format!("failed to create sub-agent: {e}"));
                self.finish_failed(&task_id).await;
                self.drain();
                return;
            }
        };
        self.inner
            .lock()
            .live_agents
            .insert(task_id.clone(), Arc::clone(&agent));

        // Sandbox next; its registry entry must exist before the first turn
        // so the preview tool can find it.
        let sandbox_kind = self.inner.settings.default_sandbox_kind;
        match self.inner.sandboxes.create(sandbox_kind).await {
            Ok(sandbox) => self.inner.registry.install(&task_id, sandbox),
            Err(e) => {
                self.fail_task(&task_id, &format!("failed to create sandbox: {e}"));
                self.finish_failed(&task_id).await;
                self.drain();
                return;
            }
        }

        // Watchdogs: one monitor subscription feeding usage counters and the
        // permission bridge, one idle timer reset by every monitored event.
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let monitor = tokio::spawn(monitor_loop(
            self.clone(),
            task_id.clone(),
            agent.subscribe(),
            activity_tx,
            Arc::clone(&agent),
            false,
        ));
        let idle_timeout = Duration::from_millis(
            snapshot
                .resource_limits
                .idle_timeout_ms
                .unwrap_or(self.inner.settings.default_idle_timeout_ms),
        );
        let watchdog = tokio::spawn(idle_watchdog(
            self.clone(),
            task_id.clone(),
            activity_rx,
            idle_timeout,
            Arc::clone(&agent),
        ));

        self.inner.progress.start(&task_id, "running");

        // Pause-loop: run the sub-agent, refueling with stashed instructions
        // until it finishes, fails, or pauses without a refuel.
        let mut input = format!(
            "[bg-task:{}] {}\n\n{}",
            task_id, snapshot.description, snapshot.prompt
        );
        let mut final_text: Option<String> = None;
        let mut agent_error: Option<String> = None;
        loop {
            match agent.complete(&input).await {
                Ok(completion) => match completion.status {
                    CompletionStatus::Ok => {
                        final_text = Some(completion.text.unwrap_or_default());
                        break;
                    }
                    CompletionStatus::Paused => {
                        let status = self.get_task(&task_id).map(|t| t.status);
                        if matches!(
                            status,
                            Some(TaskStatus::Cancelled | TaskStatus::Failed)
                        ) {
                            break;
                        }
                        match self.inner.lock().stashed_inputs.remove(&task_id) {
                            Some(next) => {
                                debug!("task [{}] refueled", short(&task_id));
                                input = next;
                            }
                            None => break,
                        }
                    }
                },
                Err(e) => {
                    agent_error = Some(e.to_string());
                    break;
                }
            }
        }

        monitor.abort();
        watchdog.abort();

        // Terminal resolution. The record is updated before any injection so
        // downstream handlers see consistent state.
        let (outcome, emit) = {
            let mut state = self.inner.lock();
            state.stashed_inputs.remove(&task_id);
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            match task.status {
                TaskStatus::Running => {
                    if let Some(text) = final_text {
                        task.status = TaskStatus::Completed;
                        task.result = Some(text);
                        (Outcome::Completed, true)
                    } else {
                        task.status = TaskStatus::Failed;
                        task.error = Some(agent_error.unwrap_or_else(|| {
                            "sub-agent paused with no pending instruction".to_string()
                        }));
                        (Outcome::Failed, true)
                    }
                }
                TaskStatus::Cancelled => (Outcome::Cancelled, false),
                TaskStatus::Failed => (Outcome::Failed, false),
                other => {
                    warn!(
                        "task [{}] finished its run in unexpected status {}",
                        short(&task_id),
                        other.as_str()
                    );
                    (Outcome::Failed, false)
                }
            }
        };

        match outcome {
            Outcome::Completed => self.finish_completed(&task_id).await,
            Outcome::Failed => {
                if emit {
                    if let Some(task) = self.get_task(&task_id) {
                        self.emit_status(&task);
                    }
                }
                self.finish_failed(&task_id).await;
            }
            Outcome::Cancelled => self.finish_cancelled(&task_id).await,
        }

        self.inner.progress.finish(&task_id);
        self.drain();
    }

    /// Keep-alive bookkeeping and injection for a successful run.
    async fn finish_completed(&self, task_id: &str) {
        let Some(task) = self.get_task(task_id) else {
            return;
        };
        info!("task [{}] completed", short(task_id));

        // Sandbox: retained only when the final text published a non-local
        // preview URL; otherwise disposed before termination is announced.
        match preview_url(task.result.as_deref().unwrap_or("")) {
            Some(url) => {
                {
                    let mut state = self.inner.lock();
                    if let Some(t) = state.tasks.get_mut(task_id) {
                        t.sandbox_url = Some(url.clone());
                        t.sandbox_alive = true;
                    }
                }
                info!("task [{}] preview published: {}", short(task_id), url);
                self.arm_sandbox_timer(task_id);
            }
            None => {
                self.dispose_sandbox(task_id).await;
            }
        }

        // Agent: kept warm for follow-up chat.
        {
            let mut state = self.inner.lock();
            if let Some(t) = state.tasks.get_mut(task_id) {
                t.agent_alive = true;
            }
        }
        self.arm_agent_timer(task_id);

        let Some(task) = self.get_task(task_id) else {
            return;
        };
        self.emit_status(&task);
        self.enqueue_injection(InjectionItem::task_completed(
            &task,
            self.inner.settings.result_truncate_chars,
        ));
    }

    async fn finish_failed(&self, task_id: &str) {
        self.dispose_sandbox(task_id).await;
        self.dispose_agent(task_id);
        if let Some(task) = self.get_task(task_id) {
            warn!(
                "task [{}] failed: {}",
                short(task_id),
                task.error.as_deref().unwrap_or("unknown error")
            );
            self.enqueue_injection(InjectionItem::task_failed(&task));
        }
    }

    async fn finish_cancelled(&self, task_id: &str) {
        self.dispose_sandbox(task_id).await;
        self.dispose_agent(task_id);
        if let Some(task) = self.get_task(task_id) {
            info!("task [{}] cancelled", short(task_id));
            self.enqueue_injection(InjectionItem::task_cancelled(&task));
        }
    }

    /// Background chat re-entry: one `complete` turn with the monitor
    /// re-registered, then a chat injection and a fresh keep-alive window.
    async fn run_chat(&self, task_id: String, agent: Arc<dyn Agent>, message: String) {
        debug!("task [{}] chat re-entry started", short(&task_id));
        let (activity_tx, _activity_rx) = watch::channel(Instant::now());
        let monitor = tokio::spawn(monitor_loop(
            self.clone(),
            task_id.clone(),
            agent.subscribe(),
            activity_tx,
            Arc::clone(&agent),
            true,
        ));

        let result = agent.complete(&message).await;
        monitor.abort();

        let item = {
            let mut state = self.inner.lock();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            task.chat_in_flight = false;
            match &result {
                Ok(completion) if completion.status == CompletionStatus::Ok => {
                    InjectionItem::chat_result(
                        task,
                        completion.text.as_deref().unwrap_or(""),
                        self.inner.settings.result_truncate_chars,
                    )
                }
                Ok(_) => InjectionItem::chat_failed(
                    task,
                    "chat was interrupted before completing",
                ),
                Err(e) => InjectionItem::chat_failed(task, &e.to_string()),
            }
        };

        // A successful chat resets the full keep-alive window; a failed one
        // re-arms it too, otherwise the agent would outlive every timer.
        self.arm_agent_timer(&task_id);
        self.enqueue_injection(item);
    }

    // ------------------------------------------------------------------
    // Watchdog support
    // ------------------------------------------------------------------

    /// Flip a running task to failed. Returns true when this call performed
    /// the transition (callers then interrupt the agent and emit exactly one
    /// status event).
    fn fail_task(&self, task_id: &str, error: &str) -> bool {
        let snapshot = {
            let mut state = self.inner.lock();
            match state.tasks.get_mut(task_id) {
                Some(task) if task.status == TaskStatus::Running => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error.to_string());
                    Some(task.clone())
                }
                _ => None,
            }
        };
        match snapshot {
            Some(task) => {
                self.emit_status(&task);
                true
            }
            None => false,
        }
    }

    fn touch_activity(&self, task_id: &str) {
        let mut state = self.inner.lock();
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.last_activity_time = Utc::now().timestamp_millis();
        }
    }

    fn arm_agent_timer(&self, task_id: &str) {
        let runner = self.clone();
        let id = task_id.to_string();
        let keep_alive = Duration::from_millis(self.inner.settings.agent_keep_alive_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(keep_alive).await;
            debug!("agent keep-alive expired for task [{}]", short(&id));
            runner.dispose_agent(&id);
        });
        let mut state = self.inner.lock();
        if let Some(old) = state.agent_timers.insert(task_id.to_string(), timer) {
            old.abort();
        }
    }

    fn arm_sandbox_timer(&self, task_id: &str) {
        let runner = self.clone();
        let id = task_id.to_string();
        let keep_alive = Duration::from_millis(self.inner.settings.sandbox_keep_alive_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(keep_alive).await;
            debug!("sandbox keep-alive expired for task [{}]", short(&id));
            runner.dispose_sandbox(&id).await;
        });
        let mut state = self.inner.lock();
        if let Some(old) = state.sandbox_timers.insert(task_id.to_string(), timer) {
            old.abort();
        }
    }

    fn emit_status(&self, task: &Task) {
        self.inner.bus.send(BusEvent::Phase {
            task_id: task.id.clone(),
            phase: task.status.as_str().to_string(),
            detail: Some(task.description.clone()),
        });
    }

    fn enqueue_injection(&self, item: InjectionItem) {
        match self.inner.injector.get() {
            Some(injector) => injector.enqueue(item),
            None => warn!(
                "injection dropped for task {} (queue not wired)",
                item.meta.task_id
            ),
        }
    }
}

/// Consume a sub-agent's monitor stream: every event counts as activity,
/// tool/step counters enforce their caps, permission requests route through
/// the bridge. In chat mode caps do not fail the (already completed) task;
/// the chat turn is interrupted instead.
async fn monitor_loop(
    runner: BgTaskRunner,
    task_id: String,
    mut events: tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>,
    activity: watch::Sender<Instant>,
    agent: Arc<dyn Agent>,
    chat_mode: bool,
) {
    let max_tool_calls = {
        let state = runner.inner.lock();
        state
            .tasks
            .get(&task_id)
            .and_then(|t| t.resource_limits.max_tool_calls)
            .unwrap_or(runner.inner.settings.default_max_tool_calls)
    };
    let max_steps = {
        let state = runner.inner.lock();
        state
            .tasks
            .get(&task_id)
            .and_then(|t| t.resource_limits.max_steps)
            .unwrap_or(runner.inner.settings.default_max_steps)
    };

    while let Some(event) = events.recv().await {
        let _ = activity.send(Instant::now());
        runner.touch_activity(&task_id);
        match event {
            MonitorEvent::PermissionRequired(request) => {
                permission::route(&runner, &task_id, request);
            }
            MonitorEvent::ToolExecuted { call } => {
                let tool_calls = {
                    let mut state = runner.inner.lock();
                    match state.tasks.get_mut(&task_id) {
                        Some(task) => {
                            task.resource_usage.tool_calls += 1;
                            task.resource_usage.tool_calls
                        }
                        None => continue,
                    }
                };
                runner.inner.bus.send(BusEvent::ToolEnd { call });
                if tool_calls >= max_tool_calls {
                    if chat_mode {
                        warn!(
                            "task [{}] hit maxToolCalls during chat; interrupting",
                            short(&task_id)
                        );
                        agent.interrupt(Some("maxToolCalls limit")).await;
                    } else if runner.fail_task(
                        &task_id,
                        &format!("maxToolCalls limit reached ({max_tool_calls})"),
                    ) {
                        agent.interrupt(Some("maxToolCalls limit")).await;
                    }
                }
            }
            MonitorEvent::StepComplete => {
                let steps = {
                    let mut state = runner.inner.lock();
                    match state.tasks.get_mut(&task_id) {
                        Some(task) => {
                            task.resource_usage.steps += 1;
                            task.resource_usage.steps
                        }
                        None => continue,
                    }
                };
                if steps >= max_steps {
                    if chat_mode {
                        agent.interrupt(Some("maxSteps limit")).await;
                    } else if runner
                        .fail_task(&task_id, &format!("maxSteps limit reached ({max_steps})"))
                    {
                        agent.interrupt(Some("maxSteps limit")).await;
                    }
                }
            }
            MonitorEvent::TokenUsage { total_tokens } => {
                // Counted as activity; tokens never terminate a task.
                let mut state = runner.inner.lock();
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.resource_usage.total_tokens += total_tokens;
                }
            }
            MonitorEvent::ContextCompression { phase, .. } => {
                debug!("task [{}] context compression: {}", short(&task_id), phase);
            }
        }
    }
}

/// Single-shot idle timer, logically replaced on every activity event. On
/// expiry the task fails and the sub-agent is interrupted; fires at most
/// once per run.
async fn idle_watchdog(
    runner: BgTaskRunner,
    task_id: String,
    mut activity: watch::Receiver<Instant>,
    idle_timeout: Duration,
    agent: Arc<dyn Agent>,
) {
    loop {
        let deadline = *activity.borrow() + idle_timeout;
        if Instant::now() >= deadline {
            let error = format!(
                "idle timeout: no activity for {}s",
                idle_timeout.as_secs().max(1)
            );
            if runner.fail_task(&task_id, &error) {
                warn!("task [{}] {}", short(&task_id), error);
                agent.interrupt(Some("idle timeout")).await;
            }
            return;
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {}
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Extract a retained preview URL from a result text: a literal
/// `[sandbox-preview](URL)` marker whose URL is not local.
fn preview_url(text: &str) -> Option<String> {
    let captures = PREVIEW_MARKER.captures(text)?;
    let url = captures.get(1)?.as_str();
    let host = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest);
    if host.starts_with("localhost") || host.starts_with("127.") {
        return None;
    }
    Some(url.to_string())
}

/// Strip a trailing `(retry #N)` / `(redo #N)` suffix so lineage suffixes do
/// not pile up across generations.
fn base_description(description: &str) -> &str {
    let trimmed = description.trim_end();
    for marker in [" (retry #", " (redo #"] {
        if let Some(idx) = trimmed.rfind(marker) {
            let tail = &trimmed[idx + marker.len()..];
            if let Some(digits) = tail.strip_suffix(')') {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    return &trimmed[..idx];
                }
            }
        }
    }
    trimmed
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests;
