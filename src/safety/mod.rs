//! Command-safety policy: a pure predicate over tool-input previews.
//!
//! Decision order: extract a command string from the (opaque) tool input,
//! refuse anything matching the danger pattern set, strip a leading
//! `env VAR=value` prefix, then require the remainder to begin with one of
//! the safe prefixes. Anything else needs human approval.
//!
//! Both pattern sets ship as defaults and can be extended through
//! [`crate::config::SafetyConfig`].

use crate::config::SafetyConfig;
use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerdict {
    /// Auto-allow: read-only or otherwise known-harmless.
    Safe,
    /// Route to a human for approval.
    NeedsApproval,
}

/// Field names probed when the tool input is a JSON object.
const COMMAND_FIELDS: &[&str] = &["command", "cmd", "script", "args", "input", "code", "query"];

/// Patterns that disqualify a command outright: filesystem mutation,
/// privilege escalation, process termination, shell metacharacters,
/// write-style git and HTTP operations.
static DANGER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        r"\brm\b",
        r"\bmv\b",
        r"\bcp\b",
        r"\bdd\b\s+if=",
        r"\b(mkfs|fdisk|diskpart)\b",
        r"\b(sudo|doas|su)\b",
        r"\b(chmod|chown)\b",
        r">",
        r"\b(kill|pkill|killall)\b",
        r"\b(shutdown|reboot|poweroff|halt)\b",
        r"`[^`]*`",
        r"\$\(",
        r"\|\s*(sh|bash|zsh|dash)\b",
        r"\bgit\s+(push|commit|reset|rebase|merge|clean|checkout|restore|rm|am|cherry-pick)\b",
        r"\b(curl|wget)\b.*(-X\s*(POST|PUT|PATCH|DELETE)|--data\b|-d\s|--form\b|-F\s|--upload-file\b|-T\s|-O\b|--output\b)",
    ];
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("built-in danger pattern must compile"))
        .collect()
});

/// Prefixes considered harmless: read-only filesystem viewers, read-only
/// git, version/listing probes, standard build-and-test scripts, and common
/// text processing.
const SAFE_PREFIXES: &[&str] = &[
    "ls",
    "cat",
    "head",
    "tail",
    "stat",
    "file",
    "du",
    "df",
    "pwd",
    "wc",
    "find",
    "tree",
    "grep",
    "rg",
    "diff",
    "jq",
    "yq",
    "sort",
    "uniq",
    "cut",
    "date",
    "whoami",
    "uname",
    "printenv",
    "which",
    "sha256sum",
    "md5sum",
    "git status",
    "git log",
    "git diff",
    "git show",
    "git branch",
    "git remote -v",
    "npm run build",
    "npm run test",
    "npm run lint",
    "npm test",
    "npm ls",
    "yarn build",
    "yarn test",
    "pnpm build",
    "pnpm test",
    "tsc --noEmit",
    "node --version",
    "npm --version",
    "python --version",
    "python3 --version",
    "pip list",
    "pip show",
    "cargo --version",
    "rustc --version",
    "go version",
];

#[derive(Default)]
pub struct SafeCommandPolicy {
    extra_danger: Vec<Regex>,
    extra_safe: Vec<String>,
}

impl SafeCommandPolicy {
    pub fn new(config: &SafetyConfig) -> Result<Self> {
        let extra_danger = config
            .extra_danger_patterns
            .iter()
            .map(|p| {
                Regex::new(p).with_context(|| format!("invalid extra danger pattern: {p}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            extra_danger,
            extra_safe: config.extra_safe_prefixes.clone(),
        })
    }

    pub fn is_safe(&self, input: &Value) -> bool {
        self.evaluate(input) == CommandVerdict::Safe
    }

    pub fn evaluate(&self, input: &Value) -> CommandVerdict {
        let Some(command) = extract_command(input) else {
            return CommandVerdict::NeedsApproval;
        };
        if self.command_is_safe(&command) {
            CommandVerdict::Safe
        } else {
            CommandVerdict::NeedsApproval
        }
    }

    fn command_is_safe(&self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() {
            return false;
        }
        if DANGER_PATTERNS
            .iter()
            .chain(self.extra_danger.iter())
            .any(|p| p.is_match(command))
        {
            return false;
        }
        let stripped = strip_env_prefix(command);
        SAFE_PREFIXES
            .iter()
            .copied()
            .chain(self.extra_safe.iter().map(String::as_str))
            .any(|prefix| matches_prefix(stripped, prefix))
    }
}

fn matches_prefix(command: &str, prefix: &str) -> bool {
    command == prefix
        || command
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(' '))
}

/// Drop a leading `env` token and any `VAR=value` assignments, returning the
/// remainder of the original string.
fn strip_env_prefix(command: &str) -> &str {
    let mut rest = command.trim_start();
    if let Some(after) = rest.strip_prefix("env ") {
        rest = after.trim_start();
    }
    loop {
        let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let token = &rest[..token_end];
        if is_env_assignment(token) && token_end < rest.len() {
            rest = rest[token_end..].trim_start();
        } else {
            return rest;
        }
    }
}

fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .enumerate()
                    .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()))
        }
        None => false,
    }
}

/// Pull a command string out of an opaque tool-input preview. Tries common
/// field names, then falls back to serializing a small single-key object.
fn extract_command(input: &Value) -> Option<String> {
    match input {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            for field in COMMAND_FIELDS {
                if let Some(value) = map.get(*field) {
                    return value_to_command(value);
                }
            }
            if map.len() == 1 {
                return map.values().next().and_then(value_to_command);
            }
            None
        }
        _ => None,
    }
}

fn value_to_command(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Some(parts.join(" "))
        }
        other => Some(other.to_string()),
    }
}
