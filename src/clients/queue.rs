//! Message queues: a JSONL-backed queue file and an in-memory variant.
//!
//! `FsMessageQueue` implements both ends of a queue (`MessageQueue` for
//! producers, `TriggerSource` for consumers) so an outbound queue of one
//! stage can feed the trigger of the next, the way the extract and dataproc
//! queues chain in the original deployment.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{ExtractError, MessageQueue, TriggerSource};

pub struct FsMessageQueue {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FsMessageQueue {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path);
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    fn read_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect()
    }

    fn rewrite(&self, lines: &[String]) -> Result<(), ExtractError> {
        let tmp = self.path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, lines.join("\n") + "\n")
            .map_err(|e| ExtractError::Queue(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ExtractError::Queue(e.to_string()))
    }
}

#[async_trait]
impl MessageQueue for FsMessageQueue {
    async fn enqueue(&self, payload: &Value) -> Result<(), ExtractError> {
        let _guard = self.guard.lock().await;
        let line = serde_json::to_string(payload).map_err(|e| ExtractError::Queue(e.to_string()))?;
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ExtractError::Queue(e.to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| ExtractError::Queue(e.to_string()))
    }
}

#[async_trait]
impl TriggerSource for FsMessageQueue {
    async fn next_message(&self) -> Result<Option<Value>, ExtractError> {
        let _guard = self.guard.lock().await;
        let mut lines = self.read_lines();
        if lines.is_empty() {
            return Ok(None);
        }
        let first = lines.remove(0);
        self.rewrite(&lines)?;
        serde_json::from_str::<Value>(&first)
            .map(Some)
            .map_err(|e| ExtractError::Queue(e.to_string()))
    }
}

/// In-memory queue for tests and embedded wiring.
#[derive(Default)]
pub struct InMemoryMessageQueue {
    items: Mutex<VecDeque<Value>>,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything currently queued, oldest first.
    pub async fn snapshot(&self) -> Vec<Value> {
        self.items.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub async fn push(&self, payload: Value) {
        self.items.lock().await.push_back(payload);
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(&self, payload: &Value) -> Result<(), ExtractError> {
        self.items.lock().await.push_back(payload.clone());
        Ok(())
    }
}

#[async_trait]
impl TriggerSource for InMemoryMessageQueue {
    async fn next_message(&self) -> Result<Option<Value>, ExtractError> {
        Ok(self.items.lock().await.pop_front())
    }
}
