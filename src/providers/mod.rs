//! History stores and work queues.
//!
//! A provider persists per-instance histories and carries three peek-lock
//! work queues: orchestrator (completions and starts), worker (activity
//! executions), and timer (pending timer schedules). Queue enqueue is
//! idempotent so at-least-once redelivery and restart rehydration cannot
//! duplicate work items.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod fs;
pub mod in_memory;

/// Which provider-backed queue a work item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Durable unit of work exchanged between the runtime's dispatchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        id: u64,
        fire_at_ms: u64,
    },
}

/// Dedup key for completion-like events; appends of a key already present in
/// history are dropped so redelivered completions stay idempotent.
pub(crate) fn completion_key(ev: &Event) -> Option<(u64, &'static str)> {
    match ev {
        Event::ActivityCompleted { id, .. } => Some((*id, "ac")),
        Event::ActivityFailed { id, .. } => Some((*id, "af")),
        Event::TimerFired { id, .. } => Some((*id, "tf")),
        // Synthetic id=0 slots dedupe terminal events
        Event::OrchestrationCompleted { .. } => Some((0, "oc")),
        Event::OrchestrationFailed { .. } => Some((0, "of")),
        _ => None,
    }
}

/// Storage contract for instance histories plus the three work queues.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full history for an instance (empty if unknown).
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append events; completion-like events already present are skipped.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    /// Remove all stored data.
    async fn reset(&self);
    async fn create_instance(&self, instance: &str) -> Result<(), String>;
    async fn remove_instance(&self, instance: &str) -> Result<(), String>;
    async fn list_instances(&self) -> Vec<String>;
    /// Produce a human-readable dump of all stored histories.
    async fn dump_all_pretty(&self) -> String;

    /// Idempotent enqueue: an item equal to one already queued is dropped.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    /// Pop the next item, keeping it invisible until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;
}
