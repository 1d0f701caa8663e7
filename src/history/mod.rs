//! Bounded in-memory transcript of the orchestrator conversation.
//!
//! Backs `GET /api/history` and the `/history [n]` command. Oldest entries
//! are pruned once the capacity is reached; durable conversation storage is
//! out of scope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

pub struct ChatHistory {
    entries: Mutex<Vec<HistoryEntry>>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push_user(&self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    pub fn push_assistant(&self, content: impl Into<String>) {
        self.push(Role::Assistant, content.into());
    }

    fn push(&self, role: Role, content: String) {
        if content.is_empty() {
            return;
        }
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.push(HistoryEntry {
            role,
            content,
            timestamp: Utc::now(),
        });
        if entries.len() > self.capacity {
            let overflow = entries.len() - self.capacity;
            entries.drain(..overflow);
        }
    }

    /// Most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = entries.len().saturating_sub(limit);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new()
    }
}
