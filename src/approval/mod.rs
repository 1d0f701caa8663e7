//! Registry of pending tool-approval requests.
//!
//! Each entry holds the one-shot responder the agent runtime is waiting on.
//! `decide` resolves an entry exactly once and removes it; unknown ids are
//! reported back to the caller rather than erroring.

use crate::agent::{PermissionDecision, PermissionResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Snapshot of a pending approval, as served by `/api/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub permission_id: String,
    pub tool: String,
    pub input_preview: serde_json::Value,
    pub task_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

struct Entry {
    info: PendingApproval,
    respond: oneshot::Sender<PermissionResponse>,
}

#[derive(Default)]
pub struct ApprovalManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval under `permission_id`.
    pub fn add(
        &self,
        permission_id: String,
        tool: String,
        input_preview: serde_json::Value,
        task_id: Option<String>,
        respond: oneshot::Sender<PermissionResponse>,
    ) {
        let info = PendingApproval {
            permission_id: permission_id.clone(),
            tool,
            input_preview,
            task_id,
            requested_at: Utc::now(),
        };
        debug!("approval pending: {}", permission_id);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.insert(permission_id.clone(), Entry { info, respond }).is_some() {
            warn!("approval {} replaced an existing entry", permission_id);
        }
    }

    /// Resolve a pending approval. Returns false when the id is unknown
    /// (already decided, or never registered).
    pub fn decide(
        &self,
        permission_id: &str,
        decision: PermissionDecision,
        note: Option<String>,
    ) -> bool {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            entries.remove(permission_id)
        };
        match entry {
            Some(entry) => {
                debug!("approval {} decided: {:?}", permission_id, decision);
                if entry
                    .respond
                    .send(PermissionResponse { decision, note })
                    .is_err()
                {
                    // The requesting turn already went away; nothing to do.
                    warn!("approval {} responder was gone", permission_id);
                }
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut list: Vec<_> = entries.values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        list
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

#[cfg(test)]
mod tests;
