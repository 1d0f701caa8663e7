//! Shared helpers for the integration suite.

use conductor::agent::Agent;
use conductor::agent::mock::{ScriptedAgent, ScriptedAgentFactory};
use conductor::config::Config;
use conductor::gateway::AppState;
use conductor::sandbox::{NullSandboxFactory, SandboxKind};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN: &str = "integration-token";

/// Assemble the full component graph with scripted sub-agents and a scripted
/// parent orchestrator.
pub fn scripted_state(
    sub_agents: Vec<Arc<ScriptedAgent>>,
    sandbox_kind: SandboxKind,
) -> (AppState, Arc<ScriptedAgent>) {
    let mut config = Config::default();
    config.gateway.auth_token = Some(TOKEN.to_string());
    let parent = ScriptedAgent::new(vec![]);
    let state = AppState::assemble(
        &config,
        parent.clone() as Arc<dyn Agent>,
        ScriptedAgentFactory::new(sub_agents),
        NullSandboxFactory::new(sandbox_kind),
    )
    .expect("assembly must succeed");
    (state, parent)
}

pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout_ms: u64) -> bool {
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
