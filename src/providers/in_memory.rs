use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

use super::{completion_key, HistoryStore, QueueKind, WorkItem};
use crate::Event;

/// In-memory history store; the default provider for tests and embedded use.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, Vec<Event>>,
    orch_queue: VecDeque<WorkItem>,
    work_queue: VecDeque<WorkItem>,
    timer_queue: VecDeque<WorkItem>,
    locked: HashMap<String, (QueueKind, WorkItem)>,
    next_token: u64,
}

impl Inner {
    fn queue_mut(&mut self, kind: QueueKind) -> &mut VecDeque<WorkItem> {
        match kind {
            QueueKind::Orchestrator => &mut self.orch_queue,
            QueueKind::Worker => &mut self.work_queue,
            QueueKind::Timer => &mut self.timer_queue,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.inner
            .lock()
            .await
            .instances
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        let history = inner
            .instances
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        let mut seen: std::collections::HashSet<(u64, &'static str)> =
            history.iter().filter_map(completion_key).collect();
        for ev in new_events {
            if let Some(key) = completion_key(&ev) {
                if !seen.insert(key) {
                    continue;
                }
            }
            history.push(ev);
        }
        Ok(())
    }

    async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if inner.instances.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        inner.instances.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if inner.instances.remove(instance).is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        self.inner.lock().await.instances.keys().cloned().collect()
    }

    async fn dump_all_pretty(&self) -> String {
        let inner = self.inner.lock().await;
        let mut out = String::new();
        for (inst, hist) in inner.instances.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for ev in hist {
                out.push_str(&format!("  {ev:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        // Idempotent: drop duplicates of queued or currently locked items
        if inner.queue_mut(kind).contains(&item) {
            return Ok(());
        }
        if inner.locked.values().any(|(_, locked)| locked == &item) {
            return Ok(());
        }
        inner.queue_mut(kind).push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut inner = self.inner.lock().await;
        let item = inner.queue_mut(kind).pop_front()?;
        inner.next_token += 1;
        let token = format!("mem-{}", inner.next_token);
        inner.locked.insert(token.clone(), (kind, item.clone()));
        Some((item, token))
    }

    async fn ack(&self, _kind: QueueKind, token: &str) -> Result<(), String> {
        self.inner.lock().await.locked.remove(token);
        Ok(())
    }

    async fn abandon(&self, _kind: QueueKind, token: &str) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        if let Some((kind, item)) = inner.locked.remove(token) {
            inner.queue_mut(kind).push_front(item);
        }
        Ok(())
    }
}
