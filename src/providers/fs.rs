use serde_json;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

use super::{completion_key, HistoryStore, QueueKind, WorkItem};
use crate::Event;

/// Simple filesystem-backed history store writing JSONL per instance.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        let timer_q = path.join("timer-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&orch_q);
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&work_q);
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&timer_q);
        Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            timer_queue_file: timer_q,
            cap: 8192,
        }
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        // Instance ids may carry separators ("extract::abc"); keep them out
        // of the path structure.
        self.root.join(instance.replace(['/', '\\'], "_"))
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }

    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }

    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    fn rewrite_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), String> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        {
            let mut tf = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| e.to_string())?;
            for it in items {
                let line = serde_json::to_string(it).map_err(|e| e.to_string())?;
                use std::io::Write as _;
                tf.write_all(line.as_bytes()).map_err(|e| e.to_string())?;
                tf.write_all(b"\n").map_err(|e| e.to_string())?;
            }
        }
        std::fs::rename(&tmp, qf).map_err(|e| e.to_string())
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    /// Read the entire JSONL file for the instance and deserialize each line.
    async fn read(&self, instance: &str) -> Vec<Event> {
        let data = fs::read_to_string(self.history_path(instance))
            .await
            .unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<Event>(line) {
                out.push(ev)
            }
        }
        out
    }

    /// Append events with a capacity guard; duplicate completion-like events
    /// are skipped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let path = self.history_path(instance);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        let existing = self.read(instance).await;
        if existing.len() + new_events.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                new_events.len()
            ));
        }
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            existing.iter().filter_map(completion_key).collect();
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        for ev in new_events {
            if let Some(key) = completion_key(&ev) {
                if !seen.insert(key) {
                    continue;
                }
            }
            let line = serde_json::to_string(&ev).map_err(|e| e.to_string())?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
            file.write_all(b"\n").await.map_err(|e| e.to_string())?;
        }
        file.flush().await.ok();
        Ok(())
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| e.to_string())?;
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance already exists: {instance}"));
        }
        fs::create_dir_all(&inst_dir)
            .await
            .map_err(|e| e.to_string())?;
        let _ = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir).await.map_err(|e| e.to_string())? {
            return Err(format!("instance not found: {instance}"));
        }
        fs::remove_dir_all(&inst_dir)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// List instances by scanning instance directories.
    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if !ent.path().is_dir() {
                    continue;
                }
                if let Some(name) = ent.file_name().to_str() {
                    if name.starts_with('.') {
                        continue;
                    }
                    out.push(name.to_string());
                }
            }
        }
        out
    }

    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for ev in self.read(&inst).await {
                out.push_str(&format!("  {ev:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        // Idempotent enqueue: load current items and only append if not present
        let mut items = self.read_queue(kind);
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.rewrite_queue(kind, &items)
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        // Pop first item but write it to a lock sidecar to keep invisible until ack/abandon
        let mut items = self.read_queue(kind);
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        self.rewrite_queue(kind, &items).ok()?;
        // Create lock token and persist the locked item
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        let token = format!("{now_ns:x}-{pid:x}");
        let _ = std::fs::create_dir_all(self.lock_dir(kind));
        let line = serde_json::to_string(&first).ok()?;
        let _ = std::fs::write(self.lock_path(kind, &token), line);
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        // Read locked item and re-enqueue at front, then remove lock
        let path = self.lock_path(kind, token);
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.read_queue(kind);
        items.insert(0, item);
        self.rewrite_queue(kind, &items)?;
        std::fs::remove_file(&path).map_err(|e| e.to_string())?;
        Ok(())
    }
}
