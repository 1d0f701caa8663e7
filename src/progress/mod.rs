//! Per-task progress heartbeats.
//!
//! Each active task gets a periodic timer that replays its latest progress
//! record to the configured sink (wired to the event bus at assembly time).
//! Progress is an orthogonal, best-effort stream: scheduler state never
//! depends on it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub type ProgressSink = Arc<dyn Fn(ProgressRecord) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub task_id: String,
    pub percent: u8,
    pub stage: String,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct Entry {
    record: ProgressRecord,
    timer: JoinHandle<()>,
}

pub struct ProgressTracker {
    interval: Duration,
    sink: ProgressSink,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ProgressTracker {
    pub fn new(interval: Duration, sink: ProgressSink) -> Self {
        Self {
            interval,
            sink,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install a heartbeat timer for a task. Replaces any previous record.
    pub fn start(&self, task_id: &str, stage: &str) {
        let record = ProgressRecord {
            task_id: task_id.to_string(),
            percent: 0,
            stage: stage.to_string(),
            message: None,
            updated_at: Utc::now(),
        };

        let entries = Arc::clone(&self.entries);
        let sink = Arc::clone(&self.sink);
        let interval = self.interval;
        let id = task_id.to_string();
        let timer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let snapshot = {
                    let entries = entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    entries.get(&id).map(|e| e.record.clone())
                };
                match snapshot {
                    Some(record) => sink(record),
                    None => break,
                }
            }
        });

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = entries.insert(task_id.to_string(), Entry { record, timer }) {
            old.timer.abort();
        }
    }

    /// Mutate a task's record and emit it once. Unknown ids are ignored
    /// (the task already finished).
    pub fn update(&self, task_id: &str, percent: u8, stage: &str, message: Option<&str>) {
        let snapshot = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match entries.get_mut(task_id) {
                Some(entry) => {
                    entry.record.percent = percent.min(100);
                    entry.record.stage = stage.to_string();
                    entry.record.message = message.map(str::to_string);
                    entry.record.updated_at = Utc::now();
                    Some(entry.record.clone())
                }
                None => None,
            }
        };
        match snapshot {
            Some(record) => (self.sink)(record),
            None => debug!("progress update for unknown task {}", task_id),
        }
    }

    /// Cancel the heartbeat and drop the record.
    pub fn finish(&self, task_id: &str) {
        let entry = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            entries.remove(task_id)
        };
        if let Some(entry) = entry {
            entry.timer.abort();
        }
    }

    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut records: Vec<_> = entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        records
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for entry in entries.values() {
            entry.timer.abort();
        }
    }
}
