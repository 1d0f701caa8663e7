use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    17820
}

fn default_max_concurrent() -> usize {
    5
}

fn default_idle_timeout_ms() -> u64 {
    120_000
}

fn default_max_tool_calls() -> u32 {
    200
}

fn default_max_steps() -> u32 {
    50
}

fn default_progress_interval_ms() -> u64 {
    15_000
}

fn default_keep_alive_ms() -> u64 {
    1_800_000
}

fn default_result_truncate_chars() -> usize {
    4_000
}

fn default_redo_truncate_chars() -> usize {
    2_000
}

fn default_shell_tool() -> String {
    "exec".to_string()
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on every endpoint (`?token=` on the SSE
    /// endpoint). When unset, the binary generates one at startup and logs
    /// it once.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

/// Background task scheduler settings. Per-task resource limits fall back
/// to these defaults when a dispatch leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub default_idle_timeout_ms: u64,
    #[serde(default = "default_max_tool_calls")]
    pub default_max_tool_calls: u32,
    #[serde(default = "default_max_steps")]
    pub default_max_steps: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_idle_timeout_ms: default_idle_timeout_ms(),
            default_max_tool_calls: default_max_tool_calls(),
            default_max_steps: default_max_steps(),
        }
    }
}

/// Post-completion keep-alive windows for sub-agents and preview sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    #[serde(default = "default_keep_alive_ms")]
    pub agent_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub sandbox_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            agent_ms: default_keep_alive_ms(),
            sandbox_ms: default_keep_alive_ms(),
        }
    }
}

/// Progress heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_progress_interval_ms(),
        }
    }
}

/// Truncation caps applied when composing injected messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionConfig {
    /// Cap on the result excerpt embedded in an injected message.
    #[serde(default = "default_result_truncate_chars")]
    pub result_truncate_chars: usize,
    /// Cap on the previous-result excerpt embedded in a redo prompt.
    #[serde(default = "default_redo_truncate_chars")]
    pub redo_truncate_chars: usize,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            result_truncate_chars: default_result_truncate_chars(),
            redo_truncate_chars: default_redo_truncate_chars(),
        }
    }
}

/// Command-safety policy settings. The built-in danger patterns and safe
/// prefixes always apply; these lists extend them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Name of the shell-exec tool the policy gates.
    #[serde(default = "default_shell_tool")]
    pub shell_tool: String,
    #[serde(default)]
    pub extra_danger_patterns: Vec<String>,
    #[serde(default)]
    pub extra_safe_prefixes: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            shell_tool: default_shell_tool(),
            extra_danger_patterns: Vec::new(),
            extra_safe_prefixes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub injection: InjectionConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for
    /// every absent field.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            anyhow::bail!("scheduler.max_concurrent must be at least 1");
        }
        if self.progress.interval_ms == 0 {
            anyhow::bail!("progress.interval_ms must be positive");
        }
        Ok(())
    }
}
