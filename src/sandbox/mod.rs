//! Sandbox contract and the task-keyed sandbox registry.
//!
//! Real sandboxes (local process jails, remote VMs) live outside this crate;
//! the scheduler only needs `kind`, `dispose`, and — for preview-capable
//! sandboxes — `get_host_url`. The registry answers "who owns the sandbox
//! for task X right now": entries are installed before a sub-agent starts
//! and removed by the final disposal of that task's sandbox.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Shares the host; tool calls need the permission bridge's scrutiny.
    Local,
    /// Isolated VM; tool calls are auto-allowed with an audit note.
    Remote,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Tear down the sandbox. Must be idempotent at the interface: a second
    /// call is a no-op, not an error.
    async fn dispose(&self) -> Result<()>;

    async fn exec(&self, _cmd: &str) -> Result<String> {
        anyhow::bail!("exec is not supported by this sandbox")
    }

    /// Public URL for a port exposed by the sandbox. Only remote
    /// preview-capable sandboxes implement this.
    async fn get_host_url(&self, _port: u16) -> Result<String> {
        anyhow::bail!("host URLs are not supported by this sandbox")
    }
}

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(&self, kind: SandboxKind) -> Result<Arc<dyn Sandbox>>;
}

/// Map from task id to the sandbox that task currently owns. Consulted by
/// the preview-URL tool, which reads the task id out of the sub-agent's
/// prompt header.
#[derive(Default)]
pub struct SandboxRegistry {
    entries: Mutex<HashMap<String, Arc<dyn Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, task_id: &str, sandbox: Arc<dyn Sandbox>) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(task_id.to_string(), sandbox);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<dyn Sandbox>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(task_id)
    }
}

/// No-op sandbox used by the dev binary and tests. Counts disposals so
/// idempotence is observable.
pub struct NullSandbox {
    kind: SandboxKind,
    disposals: AtomicUsize,
}

impl NullSandbox {
    pub fn new(kind: SandboxKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            disposals: AtomicUsize::new(0),
        })
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for NullSandbox {
    fn kind(&self) -> SandboxKind {
        self.kind
    }

    async fn dispose(&self) -> Result<()> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory producing `NullSandbox` instances; keeps every created sandbox
/// so tests can assert on disposal counts.
pub struct NullSandboxFactory {
    kind: SandboxKind,
    pub created: Mutex<Vec<Arc<NullSandbox>>>,
}

impl NullSandboxFactory {
    pub fn new(kind: SandboxKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            created: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SandboxFactory for NullSandboxFactory {
    async fn create(&self, _kind: SandboxKind) -> Result<Arc<dyn Sandbox>> {
        let sandbox = NullSandbox::new(self.kind);
        self.created.lock().unwrap().push(Arc::clone(&sandbox));
        Ok(sandbox as Arc<dyn Sandbox>)
    }
}
