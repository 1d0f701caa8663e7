//! Slash-command grammar for the chat boundary.
//!
//! `/confirm <permissionId>`, `/cancel <permissionId>`, `/status`,
//! `/history [n]`, `/help`. Anything not starting with `/` is a free-form
//! chat message.

use crate::errors::{ConductorError, ConductorResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// Approve a pending tool call.
    Confirm { permission_id: String },
    /// Deny a pending tool call.
    Cancel { permission_id: String },
    Status,
    History { limit: Option<usize> },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Command(SlashCommand),
    Chat(String),
}

pub const HELP_TEXT: &str = "\
/confirm <permissionId>  approve a pending tool call
/cancel <permissionId>   deny a pending tool call
/status                  active tasks, progress, pending approvals
/history [n]             recent conversation history
/help                    this message
anything else            chat with the orchestrator";

/// Parse raw chat input. Unknown or malformed slash commands are validation
/// errors; everything not starting with `/` is chat.
pub fn parse_input(input: &str) -> ConductorResult<ParsedInput> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConductorError::Validation("empty message".into()));
    }
    if !trimmed.starts_with('/') {
        return Ok(ParsedInput::Chat(trimmed.to_string()));
    }

    let mut parts = trimmed.split_whitespace();
    let head = parts.next().unwrap_or_default();
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(ConductorError::Validation(format!(
            "too many arguments for {head}"
        )));
    }

    let command = match head {
        "/confirm" => SlashCommand::Confirm {
            permission_id: required_arg(arg, "/confirm <permissionId>")?,
        },
        "/cancel" => SlashCommand::Cancel {
            permission_id: required_arg(arg, "/cancel <permissionId>")?,
        },
        "/status" => no_arg(arg, "/status", SlashCommand::Status)?,
        "/history" => SlashCommand::History {
            limit: match arg {
                Some(raw) => Some(raw.parse().map_err(|_| {
                    ConductorError::Validation(format!("invalid history limit: {raw}"))
                })?),
                None => None,
            },
        },
        "/help" => no_arg(arg, "/help", SlashCommand::Help)?,
        other => {
            return Err(ConductorError::Validation(format!(
                "unknown command: {other}"
            )));
        }
    };
    Ok(ParsedInput::Command(command))
}

fn required_arg(arg: Option<&str>, usage: &str) -> ConductorResult<String> {
    arg.map(str::to_string)
        .ok_or_else(|| ConductorError::Validation(format!("usage: {usage}")))
}

fn no_arg(arg: Option<&str>, name: &str, cmd: SlashCommand) -> ConductorResult<SlashCommand> {
    match arg {
        None => Ok(cmd),
        Some(_) => Err(ConductorError::Validation(format!(
            "{name} takes no arguments"
        ))),
    }
}
