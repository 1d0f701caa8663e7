use super::task::{ResourceLimits, TaskOptions, TaskPriority, TaskStatus};
use super::*;
use crate::agent::ToolCall;
use crate::agent::mock::{MonitorEmit, ScriptedAgent, ScriptedAgentFactory, ScriptedTurn};
use crate::approval::ApprovalManager;
use crate::bus::EventBus;
use crate::chat_lock::ChatLock;
use crate::history::ChatHistory;
use crate::inject::InjectionQueue;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::safety::SafeCommandPolicy;
use crate::sandbox::{NullSandboxFactory, SandboxKind, SandboxRegistry};
use serde_json::json;
use std::time::Duration;

struct Harness {
    runner: BgTaskRunner,
    /// The parent orchestrator; its recorded `chat_stream` inputs are the
    /// injected messages, in order.
    parent: Arc<ScriptedAgent>,
    factory: Arc<ScriptedAgentFactory>,
    sandboxes: Arc<NullSandboxFactory>,
    registry: Arc<SandboxRegistry>,
}

impl Harness {
    fn injections(&self) -> Vec<String> {
        self.parent.stream_inputs.lock().unwrap().clone()
    }

    fn injection_count(&self, marker: &str) -> usize {
        self.injections()
            .iter()
            .filter(|m| m.starts_with(marker))
            .count()
    }

    fn dispatched_templates(&self) -> Vec<String> {
        self.factory
            .created
            .lock()
            .unwrap()
            .iter()
            .map(|(template, _)| template.clone())
            .collect()
    }
}

fn harness(settings: RunnerSettings, agents: Vec<Arc<ScriptedAgent>>) -> Harness {
    harness_with_sandbox(settings, agents, SandboxKind::Local)
}

fn harness_with_sandbox(
    settings: RunnerSettings,
    agents: Vec<Arc<ScriptedAgent>>,
    sandbox_kind: SandboxKind,
) -> Harness {
    let bus = Arc::new(EventBus::new());
    let chat_lock = Arc::new(ChatLock::new());
    let history = Arc::new(ChatHistory::new());
    let approvals = Arc::new(ApprovalManager::new());
    let registry = Arc::new(SandboxRegistry::new());
    let sink: ProgressSink = Arc::new(|_| {});
    let progress = Arc::new(ProgressTracker::new(Duration::from_secs(60), sink));
    let factory = ScriptedAgentFactory::new(agents);
    let sandboxes = NullSandboxFactory::new(sandbox_kind);

    let runner = BgTaskRunner::new(
        settings,
        RunnerDeps {
            agents: factory.clone(),
            sandboxes: sandboxes.clone(),
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
            progress,
            approvals,
            policy: Arc::new(SafeCommandPolicy::default()),
        },
    );

    let parent = ScriptedAgent::new(vec![]);
    let injector = Arc::new(InjectionQueue::new(
        parent.clone(),
        bus,
        chat_lock,
        history,
    ));
    runner.set_injector(injector);

    Harness {
        runner,
        parent,
        factory,
        sandboxes,
        registry,
    }
}

fn fast_settings() -> RunnerSettings {
    RunnerSettings::default()
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn slow_finish(text: &str, delay_ms: u64) -> ScriptedTurn {
    ScriptedTurn::finish(text).emit(
        Duration::from_millis(delay_ms),
        MonitorEmit::StepComplete,
    )
}

// ------------------------------------------------------------------
// Dispatch & priority
// ------------------------------------------------------------------

#[tokio::test]
async fn priority_order_with_single_slot() {
    // S1: normal, then low, then high. Completion order: first, high, low.
    let mut settings = fast_settings();
    settings.max_concurrent = 1;
    let h = harness(
        settings,
        vec![
            ScriptedAgent::new(vec![slow_finish("one", 80)]),
            ScriptedAgent::new(vec![slow_finish("three", 10)]),
            ScriptedAgent::new(vec![slow_finish("two", 10)]),
        ],
    );

    let t1 = h.runner.start("worker-a", "p1", "first", TaskOptions::default());
    let t2 = h.runner.start(
        "worker-b",
        "p2",
        "second",
        TaskOptions {
            priority: TaskPriority::Low,
            ..TaskOptions::default()
        },
    );
    let t3 = h.runner.start(
        "worker-c",
        "p3",
        "third",
        TaskOptions {
            priority: TaskPriority::High,
            ..TaskOptions::default()
        },
    );

    assert!(
        wait_until(
            || {
                [&t1, &t2, &t3].iter().all(|id| {
                    h.runner.get_task(id).map(|t| t.status) == Some(TaskStatus::Completed)
                })
            },
            5_000,
        )
        .await
    );
    assert_eq!(
        h.dispatched_templates(),
        vec!["worker-a", "worker-c", "worker-b"]
    );
}

#[tokio::test]
async fn fifo_within_same_priority() {
    let mut settings = fast_settings();
    settings.max_concurrent = 1;
    let h = harness(
        settings,
        vec![
            ScriptedAgent::new(vec![slow_finish("a", 60)]),
            ScriptedAgent::new(vec![slow_finish("b", 10)]),
            ScriptedAgent::new(vec![slow_finish("c", 10)]),
        ],
    );
    let ids = [
        h.runner.start("w-1", "p", "one", TaskOptions::default()),
        h.runner.start("w-2", "p", "two", TaskOptions::default()),
        h.runner.start("w-3", "p", "three", TaskOptions::default()),
    ];
    assert!(
        wait_until(
            || {
                ids.iter().all(|id| {
                    h.runner.get_task(id).map(|t| t.status) == Some(TaskStatus::Completed)
                })
            },
            5_000,
        )
        .await
    );
    assert_eq!(h.dispatched_templates(), vec!["w-1", "w-2", "w-3"]);
}

#[tokio::test]
async fn running_never_exceeds_max_concurrent() {
    // B1 / P1: with two slots, the third task waits; finishing one running
    // task starts exactly one queued task.
    let mut settings = fast_settings();
    settings.max_concurrent = 2;
    let h = harness(
        settings,
        vec![
            ScriptedAgent::new(vec![ScriptedTurn::hang()]),
            ScriptedAgent::new(vec![ScriptedTurn::hang()]),
            ScriptedAgent::new(vec![slow_finish("late", 10)]),
        ],
    );

    let t1 = h.runner.start("w-1", "p", "one", TaskOptions::default());
    let _t2 = h.runner.start("w-2", "p", "two", TaskOptions::default());
    let t3 = h.runner.start("w-3", "p", "three", TaskOptions::default());

    assert!(wait_until(|| h.runner.get_active_tasks().len() == 2, 2_000).await);
    assert_eq!(h.runner.get_queued_tasks().len(), 1);
    assert_eq!(h.dispatched_templates().len(), 2);

    // Free one slot; exactly the queued task is promoted.
    assert!(h.runner.cancel(&t1, None).await);
    assert!(
        wait_until(
            || h.runner.get_task(&t3).map(|t| t.status) == Some(TaskStatus::Completed),
            5_000,
        )
        .await
    );
    assert!(h.runner.get_active_tasks().len() <= 2);
    assert_eq!(h.dispatched_templates().len(), 3);
}

// ------------------------------------------------------------------
// Cancellation
// ------------------------------------------------------------------

#[tokio::test]
async fn cancel_queued_task_never_starts() {
    // S6 / P7 / L1: a queued task cancels before any drain can start it and
    // produces exactly one task_cancelled injection.
    let mut settings = fast_settings();
    settings.max_concurrent = 1;
    let h = harness(
        settings,
        vec![ScriptedAgent::new(vec![ScriptedTurn::hang()])],
    );

    let t1 = h.runner.start("w-1", "p", "blocker", TaskOptions::default());
    let t2 = h.runner.start("w-2", "p", "victim", TaskOptions::default());

    assert!(h.runner.cancel(&t2, Some("changed my mind")).await);
    let task = h.runner.get_task(&t2).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.cancel_reason.as_deref(), Some("changed my mind"));
    assert!(task.start_time.is_none());
    assert!(h.runner.get_queued_tasks().is_empty());

    assert!(wait_until(|| h.injection_count("[子任务取消]") >= 1, 2_000).await);

    // Unblock the runner; the cancelled task must never be dispatched.
    assert!(h.runner.cancel(&t1, None).await);
    assert!(
        wait_until(|| h.injection_count("[子任务取消]") == 2, 2_000).await,
        "expected exactly one cancellation injection per task"
    );
    assert_eq!(h.dispatched_templates(), vec!["w-1"]);
}

#[tokio::test]
async fn cancel_running_task_interrupts_and_injects_once() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::hang()])],
    );
    let id = h.runner.start("w-1", "p", "long job", TaskOptions::default());
    assert!(wait_until(|| h.runner.get_active_tasks().len() == 1, 2_000).await);

    assert!(h.runner.cancel(&id, Some("superseded")).await);
    assert_eq!(
        h.runner.get_task(&id).unwrap().status,
        TaskStatus::Cancelled
    );

    assert!(wait_until(|| h.injection_count("[子任务取消]") == 1, 2_000).await);
    let message = h.injections().pop().unwrap();
    assert!(message.contains("superseded"));

    // Terminal: a second cancel is rejected.
    assert!(!h.runner.cancel(&id, None).await);
    // Cancelled runs do not keep their agent warm.
    assert!(!h.runner.get_task(&id).unwrap().agent_alive);
}

#[tokio::test]
async fn cancel_unknown_or_terminal_returns_false() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("done")])],
    );
    assert!(!h.runner.cancel("missing", None).await);

    let id = h.runner.start("w", "p", "quick", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );
    assert!(!h.runner.cancel(&id, None).await);
}

// ------------------------------------------------------------------
// Watchdogs
// ------------------------------------------------------------------

#[tokio::test]
async fn idle_timeout_fails_a_stuck_task() {
    // S2: no events at all; after the idle window the task fails with a
    // descriptive error and a task_failed injection appears.
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::hang()])],
    );
    let id = h.runner.start(
        "w",
        "p",
        "stuck",
        TaskOptions {
            limits: ResourceLimits {
                idle_timeout_ms: Some(200),
                ..ResourceLimits::default()
            },
            ..TaskOptions::default()
        },
    );

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            3_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert!(task.error.as_deref().unwrap().contains("idle timeout"));
    assert!(wait_until(|| h.injection_count("[子任务失败]") == 1, 2_000).await);
}

#[tokio::test]
async fn activity_resets_the_idle_timer() {
    // B2: steady events keep a slow task alive well past the idle window.
    let mut turn = ScriptedTurn::finish("made it");
    for _ in 0..6 {
        turn = turn.emit(Duration::from_millis(60), MonitorEmit::StepComplete);
    }
    let h = harness(fast_settings(), vec![ScriptedAgent::new(vec![turn])]);
    let id = h.runner.start(
        "w",
        "p",
        "slow but alive",
        TaskOptions {
            limits: ResourceLimits {
                idle_timeout_ms: Some(150),
                max_steps: Some(100),
                ..ResourceLimits::default()
            },
            ..TaskOptions::default()
        },
    );

    assert!(
        wait_until(
            || {
                h.runner
                    .get_task(&id)
                    .map(|t| t.status.is_terminal())
                    .unwrap_or(false)
            },
            3_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("made it"));
}

#[tokio::test]
async fn tool_call_cap_fails_on_equality() {
    // P2 / I4: the cap triggers termination exactly when usage reaches it.
    let call = ToolCall {
        name: "exec".to_string(),
        input: json!({"command": "ls"}),
    };
    let turn = ScriptedTurn::hang()
        .emit(
            Duration::from_millis(10),
            MonitorEmit::ToolExecuted { call: call.clone() },
        )
        .emit(
            Duration::from_millis(10),
            MonitorEmit::ToolExecuted { call: call.clone() },
        )
        .emit(
            Duration::from_millis(200),
            MonitorEmit::ToolExecuted { call },
        );
    let h = harness(fast_settings(), vec![ScriptedAgent::new(vec![turn])]);
    let id = h.runner.start(
        "w",
        "p",
        "tool hungry",
        TaskOptions {
            limits: ResourceLimits {
                max_tool_calls: Some(2),
                ..ResourceLimits::default()
            },
            ..TaskOptions::default()
        },
    );

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            3_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert!(task.error.as_deref().unwrap().contains("maxToolCalls"));
    assert_eq!(task.resource_usage.tool_calls, 2);
    assert!(wait_until(|| h.injection_count("[子任务失败]") == 1, 2_000).await);
}

#[tokio::test]
async fn step_cap_fails_task() {
    let turn = ScriptedTurn::hang()
        .emit(Duration::from_millis(10), MonitorEmit::StepComplete)
        .emit(Duration::from_millis(10), MonitorEmit::StepComplete);
    let h = harness(fast_settings(), vec![ScriptedAgent::new(vec![turn])]);
    let id = h.runner.start(
        "w",
        "p",
        "steppy",
        TaskOptions {
            limits: ResourceLimits {
                max_steps: Some(2),
                ..ResourceLimits::default()
            },
            ..TaskOptions::default()
        },
    );

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            3_000,
        )
        .await
    );
    assert!(
        h.runner
            .get_task(&id)
            .unwrap()
            .error
            .unwrap()
            .contains("maxSteps")
    );
}

#[tokio::test]
async fn token_usage_accumulates_but_never_caps() {
    let turn = ScriptedTurn::finish("fine")
        .emit(
            Duration::from_millis(10),
            MonitorEmit::TokenUsage { total_tokens: 700 },
        )
        .emit(
            Duration::from_millis(10),
            MonitorEmit::TokenUsage { total_tokens: 300 },
        );
    let h = harness(fast_settings(), vec![ScriptedAgent::new(vec![turn])]);
    let id = h.runner.start("w", "p", "tokens", TaskOptions::default());

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            3_000,
        )
        .await
    );
    assert_eq!(h.runner.get_task(&id).unwrap().resource_usage.total_tokens, 1_000);
}

// ------------------------------------------------------------------
// Steering
// ------------------------------------------------------------------

#[tokio::test]
async fn send_message_refuels_a_paused_turn() {
    // S3: stash an instruction mid-run; the pause-loop resumes with it and
    // the final result reflects the steering.
    let call = ToolCall {
        name: "exec".to_string(),
        input: json!({"command": "ls"}),
    };
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::hang().emit(
            Duration::from_millis(10),
            MonitorEmit::ToolExecuted { call },
        ),
        ScriptedTurn::finish("stopped early: ABORT"),
    ]);
    let h = harness(fast_settings(), vec![agent.clone()]);
    let id = h.runner.start("w", "p", "steerable", TaskOptions::default());

    assert!(
        wait_until(
            || {
                h.runner
                    .get_task(&id)
                    .map(|t| t.resource_usage.tool_calls)
                    .unwrap_or(0)
                    >= 1
            },
            2_000,
        )
        .await
    );
    assert!(h.runner.send_message(&id, "STOP and say ABORT").await);

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            3_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert!(task.result.as_deref().unwrap().ends_with("ABORT"));

    let inputs = agent.completions.lock().unwrap().clone();
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[1], "STOP and say ABORT");
    // The first input carries the task-context header.
    assert!(inputs[0].starts_with(&format!("[bg-task:{id}]")));
}

#[tokio::test]
async fn send_message_rejected_unless_running() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("done")])],
    );
    assert!(!h.runner.send_message("missing", "hello").await);

    let id = h.runner.start("w", "p", "quick", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );
    assert!(!h.runner.send_message(&id, "too late").await);
}

#[tokio::test]
async fn pause_without_refuel_fails_the_task() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::pause()])],
    );
    let id = h.runner.start("w", "p", "flaky", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            2_000,
        )
        .await
    );
    assert!(
        h.runner
            .get_task(&id)
            .unwrap()
            .error
            .unwrap()
            .contains("no pending instruction")
    );
}

// ------------------------------------------------------------------
// Keep-alive & chat re-entry
// ------------------------------------------------------------------

#[tokio::test]
async fn completed_task_keeps_agent_and_allows_chat() {
    // S5: chat re-entry works inside the keep-alive window, produces a
    // chat_result injection, and resets the window.
    let mut settings = fast_settings();
    settings.agent_keep_alive_ms = 500;
    let agent = ScriptedAgent::new(vec![
        ScriptedTurn::finish("initial result"),
        ScriptedTurn::finish("chat reply"),
    ]);
    let h = harness(settings, vec![agent]);
    let id = h.runner.start("w", "p", "chatty", TaskOptions::default());

    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.agent_alive) == Some(true),
            2_000,
        )
        .await
    );

    // Late in the window, chat: the timer is replaced, not expired.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let started = h.runner.chat_async(&id, "follow-up question");
    assert!(started.ok, "{:?}", started.error);

    assert!(wait_until(|| h.injection_count("[子任务对话回复]") == 1, 2_000).await);
    let task = h.runner.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.chat_in_flight);
    assert!(task.agent_alive, "chat must reset the keep-alive window");
    assert!(
        h.injections()
            .iter()
            .any(|m| m.starts_with("[子任务对话回复]") && m.contains("chat reply"))
    );

    // A fresh full window elapses, then the agent is disposed.
    assert!(
        wait_until(|| !h.runner.get_task(&id).unwrap().agent_alive, 2_000).await,
        "keep-alive timer must eventually dispose the agent"
    );
}

#[tokio::test]
async fn chat_rejected_without_live_agent() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::hang()])],
    );
    let missing = h.runner.chat_async("missing", "hi");
    assert!(!missing.ok);

    let id = h.runner.start("w", "p", "busy", TaskOptions::default());
    assert!(wait_until(|| h.runner.get_active_tasks().len() == 1, 2_000).await);
    let running = h.runner.chat_async(&id, "hi");
    assert!(!running.ok, "running tasks have no keep-alive agent");
    h.runner.cancel(&id, None).await;
}

#[tokio::test]
async fn expired_keep_alive_disposes_agent() {
    let mut settings = fast_settings();
    settings.agent_keep_alive_ms = 100;
    let h = harness(
        settings,
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("done")])],
    );
    let id = h.runner.start("w", "p", "short lived", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.agent_alive) == Some(true),
            2_000,
        )
        .await
    );
    assert!(wait_until(|| !h.runner.get_task(&id).unwrap().agent_alive, 2_000).await);
    let rejected = h.runner.chat_async(&id, "too late");
    assert!(!rejected.ok);
}

#[tokio::test]
async fn dispose_agent_is_idempotent() {
    // P8.
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("done")])],
    );
    let id = h.runner.start("w", "p", "x", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.agent_alive) == Some(true),
            2_000,
        )
        .await
    );
    h.runner.dispose_agent(&id);
    assert!(!h.runner.get_task(&id).unwrap().agent_alive);
    h.runner.dispose_agent(&id);
    assert!(!h.runner.get_task(&id).unwrap().agent_alive);
}

// ------------------------------------------------------------------
// Sandbox preview & disposal
// ------------------------------------------------------------------

#[tokio::test]
async fn preview_marker_keeps_sandbox_alive() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish(
            "deployed! [sandbox-preview](https://box-42.preview.example/app)",
        )])],
    );
    let id = h.runner.start("w", "p", "deploy", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert!(task.sandbox_alive);
    assert_eq!(
        task.sandbox_url.as_deref(),
        Some("https://box-42.preview.example/app")
    );
    assert_eq!(h.sandboxes.created.lock().unwrap()[0].disposals(), 0);
    assert!(h.registry.get(&id).is_some());

    // Explicit early disposal; idempotent (P8).
    assert!(h.runner.dispose_sandbox(&id).await);
    assert!(!h.runner.dispose_sandbox(&id).await);
    assert_eq!(h.sandboxes.created.lock().unwrap()[0].disposals(), 1);
    assert!(!h.runner.get_task(&id).unwrap().sandbox_alive);
    assert!(h.registry.get(&id).is_none());
}

#[tokio::test]
async fn localhost_preview_is_filtered() {
    // B4.
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish(
            "running at [sandbox-preview](http://localhost:3000)",
        )])],
    );
    let id = h.runner.start("w", "p", "local", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );
    let task = h.runner.get_task(&id).unwrap();
    assert!(!task.sandbox_alive);
    assert!(task.sandbox_url.is_none());
    assert_eq!(h.sandboxes.created.lock().unwrap()[0].disposals(), 1);
}

#[tokio::test]
async fn plain_completion_disposes_sandbox_before_announcement() {
    // B3: by the time the injection is enqueued the sandbox is gone.
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("no preview here")])],
    );
    let id = h.runner.start("w", "p", "plain", TaskOptions::default());
    assert!(wait_until(|| h.injection_count("[子任务完成]") == 1, 2_000).await);
    assert_eq!(h.sandboxes.created.lock().unwrap()[0].disposals(), 1);
    assert!(!h.runner.get_task(&id).unwrap().sandbox_alive);
}

// ------------------------------------------------------------------
// Retry / redo lineage
// ------------------------------------------------------------------

#[tokio::test]
async fn retry_preserves_lineage() {
    // L2.
    let h = harness(
        fast_settings(),
        vec![
            ScriptedAgent::new(vec![ScriptedTurn::pause()]), // fails fast
            ScriptedAgent::new(vec![ScriptedTurn::finish("second time lucky")]),
        ],
    );
    let limits = ResourceLimits {
        max_tool_calls: Some(7),
        max_steps: Some(3),
        idle_timeout_ms: None,
    };
    let id = h.runner.start(
        "worker",
        "original prompt",
        "fragile job",
        TaskOptions {
            priority: TaskPriority::High,
            limits,
            skills: vec!["git".to_string(), "rust".to_string()],
        },
    );
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            2_000,
        )
        .await
    );

    let retry_id = h.runner.retry(&id, None).unwrap();
    let retried = h.runner.get_task(&retry_id).unwrap();
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.prompt, "original prompt");
    assert_eq!(retried.priority, TaskPriority::High);
    assert_eq!(retried.skills, vec!["git", "rust"]);
    assert_eq!(retried.resource_limits.max_tool_calls, Some(7));
    assert_eq!(retried.description, "fragile job (retry #1)");

    assert!(
        wait_until(
            || {
                h.runner.get_task(&retry_id).map(|t| t.status) == Some(TaskStatus::Completed)
            },
            2_000,
        )
        .await
    );
}

#[tokio::test]
async fn retry_with_modified_prompt() {
    let h = harness(
        fast_settings(),
        vec![
            ScriptedAgent::new(vec![ScriptedTurn::pause()]),
            ScriptedAgent::new(vec![ScriptedTurn::finish("ok")]),
        ],
    );
    let id = h.runner.start("w", "old prompt", "job", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            2_000,
        )
        .await
    );
    let retry_id = h
        .runner
        .retry(&id, Some("new improved prompt".to_string()))
        .unwrap();
    assert_eq!(
        h.runner.get_task(&retry_id).unwrap().prompt,
        "new improved prompt"
    );
}

#[tokio::test]
async fn retry_requires_failed_or_cancelled() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("done")])],
    );
    assert!(matches!(
        h.runner.retry("missing", None),
        Err(crate::errors::ConductorError::NotFound(_))
    ));

    let id = h.runner.start("w", "p", "job", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );
    assert!(matches!(
        h.runner.retry(&id, None),
        Err(crate::errors::ConductorError::State(_))
    ));
}

#[tokio::test]
async fn redo_appends_feedback_and_composes_prompt() {
    // L3.
    let mut settings = fast_settings();
    settings.redo_truncate_chars = 12;
    let h = harness(
        settings,
        vec![
            ScriptedAgent::new(vec![ScriptedTurn::finish(
                "a result that is much longer than the excerpt cap",
            )]),
            ScriptedAgent::new(vec![ScriptedTurn::finish("better")]),
        ],
    );
    let id = h.runner.start("w", "write the report", "report", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Completed),
            2_000,
        )
        .await
    );

    let redo_id = h.runner.redo(&id, "too long, tighten it").unwrap();
    let redone = h.runner.get_task(&redo_id).unwrap();
    assert_eq!(redone.redo_history, vec!["too long, tighten it"]);
    assert_eq!(redone.description, "report (redo #1)");
    assert!(redone.prompt.starts_with("write the report"));
    assert!(redone.prompt.contains("[previous result was rejected]"));
    assert!(redone.prompt.contains("too long, tighten it"));
    // Previous result excerpt capped at redo_truncate_chars.
    assert!(redone.prompt.contains("a result that"));
    assert!(!redone.prompt.contains("excerpt cap"));
}

#[tokio::test]
async fn redo_requires_completed() {
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::pause()])],
    );
    let id = h.runner.start("w", "p", "job", TaskOptions::default());
    assert!(
        wait_until(
            || h.runner.get_task(&id).map(|t| t.status) == Some(TaskStatus::Failed),
            2_000,
        )
        .await
    );
    assert!(matches!(
        h.runner.redo(&id, "feedback"),
        Err(crate::errors::ConductorError::State(_))
    ));
}

#[tokio::test]
async fn lineage_suffixes_do_not_pile_up() {
    assert_eq!(base_description("job (retry #1)"), "job");
    assert_eq!(base_description("job (redo #12)"), "job");
    assert_eq!(base_description("job (retry #x)"), "job (retry #x)");
    assert_eq!(base_description("plain job"), "plain job");
}

// ------------------------------------------------------------------
// Injections & bookkeeping
// ------------------------------------------------------------------

#[tokio::test]
async fn completion_injects_exactly_once_with_result() {
    // P4.
    let h = harness(
        fast_settings(),
        vec![ScriptedAgent::new(vec![ScriptedTurn::finish("the deliverable")])],
    );
    let id = h.runner.start("worker-7", "p", "one shot", TaskOptions::default());
    assert!(wait_until(|| h.injection_count("[子任务完成]") == 1, 2_000).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.injections().len(), 1);

    let message = &h.injections()[0];
    assert!(message.contains(&format!("taskId={id}")));
    assert!(message.contains("agent=worker-7"));
    assert!(message.contains("the deliverable"));
}

#[tokio::test]
async fn preview_parser_recognizes_markers() {
    assert_eq!(
        preview_url("see [sandbox-preview](https://a.example/x) for details"),
        Some("https://a.example/x".to_string())
    );
    assert_eq!(preview_url("see [sandbox-preview](http://localhost:8080)"), None);
    assert_eq!(preview_url("see [sandbox-preview](localhost:8080)"), None);
    assert_eq!(preview_url("see [sandbox-preview](http://127.0.0.1:80)"), None);
    assert_eq!(preview_url("no marker at all"), None);
    assert_eq!(preview_url("[other-link](https://a.example)"), None);
}

#[tokio::test]
async fn all_tasks_are_retained_forever() {
    let h = harness(
        fast_settings(),
        vec![
            ScriptedAgent::new(vec![ScriptedTurn::finish("a")]),
            ScriptedAgent::new(vec![ScriptedTurn::finish("b")]),
        ],
    );
    let a = h.runner.start("w", "p", "first", TaskOptions::default());
    let b = h.runner.start("w", "p", "second", TaskOptions::default());
    assert!(
        wait_until(
            || {
                h.runner
                    .get_all_tasks()
                    .iter()
                    .all(|t| t.status == TaskStatus::Completed)
            },
            2_000,
        )
        .await
    );
    let all = h.runner.get_all_tasks();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, a);
    assert_eq!(all[1].id, b);
}
