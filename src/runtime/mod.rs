//! In-process runtime that executes activities and timers and persists
//! history via a `HistoryStore`.
//!
//! Three background dispatchers drain the provider queues: the orchestrator
//! dispatcher routes starts and completions to per-instance inboxes
//! (rehydrating dehydrated instances), the work dispatcher executes
//! activities against the registry, and the timer dispatcher turns timer
//! schedules into fired timers. Each running instance is a replay loop:
//! poll the orchestrator once, persist new events, dispatch decisions,
//! wait for completions, repeat.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{run_turn_with, Action, Event, OrchestrationContext};

pub mod registry;
pub mod status;

pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use status::{OrchestrationStatus, WaitError};

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Completion messages delivered to a running instance's inbox.
#[derive(Debug)]
pub enum InstanceMsg {
    ActivityCompleted {
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
}

/// How `TimerSchedule` work items become `TimerFired`.
///
/// `WallClock` fires a timer when its logical due time is reached on the
/// wall clock. `Logical` fires immediately; the orchestration's logical
/// clock still advances to `fire_at_ms`, which lets tests cross multi-hour
/// poll deadlines without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerMode {
    #[default]
    WallClock,
    Logical,
}

pub(crate) fn now_wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    pub(crate) history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<InstanceMsg>>>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<(Vec<Event>, Result<String, String>)>>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    timer_mode: TimerMode,
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 64;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_timer_mode(
            history_store,
            activity_registry,
            orchestration_registry,
            TimerMode::WallClock,
        )
        .await
    }

    /// Start a new runtime with an explicit timer mode.
    pub async fn start_with_timer_mode(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        timer_mode: TimerMode,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        let runtime = Arc::new(Self {
            history_store,
            orchestration_registry,
            inboxes: Mutex::new(HashMap::new()),
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            timer_mode,
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        // Bootstrap rehydration: resume every stored instance that has not
        // reached a terminal state (crash/restart recovery).
        runtime.clone().recover_unfinished_instances().await;

        runtime
    }

    async fn recover_unfinished_instances(self: Arc<Self>) {
        for instance in self.history_store.list_instances().await {
            let hist = self.history_store.read(&instance).await;
            if hist.is_empty() || has_terminal(&hist) {
                continue;
            }
            let name = hist.iter().find_map(|e| match e {
                Event::OrchestrationStarted { name, .. } => Some(name.clone()),
                _ => None,
            });
            if let Some(name) = name {
                info!(instance = %instance, orchestration = %name, "resuming unfinished instance after restart");
                self.ensure_instance_active(&instance, &name).await;
            }
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let inner = self
            .clone()
            .spawn_instance_to_completion(instance, orchestration_name);
        // Wrap to normalize handle type to JoinHandle<()>
        let wrapper = tokio::spawn(async move {
            let _ = inner.await;
        });
        self.instance_joins.lock().await.push(wrapper);
        true
    }

    async fn start_internal_rx(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<oneshot::Receiver<(Vec<Event>, Result<String, String>)>, String> {
        // Ensure instance exists (best-effort)
        let _ = self.history_store.create_instance(instance).await;
        // Append start marker if empty
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() {
            let started = vec![Event::OrchestrationStarted {
                name: orchestration_name.to_string(),
                input,
                started_at_ms: now_wall_ms(),
            }];
            self.history_store
                .append(instance, started)
                .await
                .map_err(|e| format!("failed to append OrchestrationStarted: {e}"))?;
        } else {
            // At-least-once trigger sources redeliver; attach to the
            // existing execution instead of starting a second one.
            warn!(
                instance,
                "instance already has history; duplicate start accepted (deduped)"
            );
        }
        self.ensure_instance_active(instance, orchestration_name).await;
        // Register a oneshot waiter for the result
        let (tx, rx) = oneshot::channel::<(Vec<Event>, Result<String, String>)>();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    /// Start an orchestration using raw String input/output.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, String> {
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, input.into())
            .await?;
        Ok(tokio::spawn(async move { rx.await.expect("result") }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, payload)
            .await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = rx.await.expect("result");
            let res_t: Result<Out, String> = match res_s {
                Ok(s) => Json::decode::<Out>(&s),
                Err(e) => Err(e),
            };
            (hist, res_t)
        }))
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self
                    .history_store
                    .dequeue_peek_lock(QueueKind::Orchestrator)
                    .await
                {
                    match item {
                        WorkItem::StartOrchestration {
                            instance,
                            orchestration,
                            input,
                        } => {
                            debug!(instance = %instance, orchestration = %orchestration, "dequeued StartOrchestration");
                            let _ = self
                                .clone()
                                .start_orchestration(&instance, &orchestration, input)
                                .await;
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                        WorkItem::ActivityCompleted { instance, id, result } => {
                            let msg = InstanceMsg::ActivityCompleted {
                                id,
                                result,
                                ack_token: Some(token.clone()),
                            };
                            self.deliver_or_rehydrate(&instance, token, msg).await;
                        }
                        WorkItem::ActivityFailed { instance, id, error } => {
                            let msg = InstanceMsg::ActivityFailed {
                                id,
                                error,
                                ack_token: Some(token.clone()),
                            };
                            self.deliver_or_rehydrate(&instance, token, msg).await;
                        }
                        WorkItem::TimerFired {
                            instance,
                            id,
                            fire_at_ms,
                        } => {
                            let msg = InstanceMsg::TimerFired {
                                id,
                                fire_at_ms,
                                ack_token: Some(token.clone()),
                            };
                            self.deliver_or_rehydrate(&instance, token, msg).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Orchestrator dispatcher");
                            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS))
                        .await;
                }
            }
        })
    }

    /// Deliver a completion to a running instance, or rehydrate it first.
    /// Stale and duplicate completions are acked and dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, instance: &str, token: String, msg: InstanceMsg) {
        let hist = self.history_store.read(instance).await;
        if has_terminal(&hist) || completion_in_history(&hist, &msg) {
            debug!(instance, ?msg, "dropping stale or duplicate completion");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }

        // Ensure instance is active; if dehydrated, rehydrate and abandon for redelivery
        if !self.inboxes.lock().await.contains_key(instance) {
            let orch_name = hist.iter().find_map(|e| match e {
                Event::OrchestrationStarted { name, .. } => Some(name.clone()),
                _ => None,
            });
            let orch_name = match orch_name {
                Some(n) => n,
                None => {
                    error!(
                        instance,
                        "rehydration requested but no OrchestrationStarted found; state corruption"
                    );
                    panic!("no OrchestrationStarted in history for instance");
                }
            };
            self.ensure_instance_active(instance, &orch_name).await;
            let _ = self
                .history_store
                .abandon(QueueKind::Orchestrator, &token)
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }

        // Active: forward; if the inbox closed concurrently, abandon for redelivery
        let delivered = {
            let inboxes = self.inboxes.lock().await;
            match inboxes.get(instance) {
                Some(tx) => tx.send(msg).is_ok(),
                None => false,
            }
        };
        if !delivered {
            let _ = self
                .history_store
                .abandon(QueueKind::Orchestrator, &token)
                .await;
        }
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) =
                    self.history_store.dequeue_peek_lock(QueueKind::Worker).await
                {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            id,
                            name,
                            input,
                        } => {
                            // Execute concurrently; slow collaborator calls must
                            // not stall other instances' activities.
                            let rt = self.clone();
                            let acts = activities.clone();
                            tokio::spawn(async move {
                                let outcome = match acts.get(&name) {
                                    Some(handler) => handler.invoke(input).await,
                                    None => Err(format!("unregistered:{name}")),
                                };
                                let work = match outcome {
                                    Ok(result) => WorkItem::ActivityCompleted {
                                        instance: instance.clone(),
                                        id,
                                        result,
                                    },
                                    Err(error) => WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        id,
                                        error,
                                    },
                                };
                                let _ = rt
                                    .history_store
                                    .enqueue_work(QueueKind::Orchestrator, work)
                                    .await;
                                let _ = rt.history_store.ack(QueueKind::Worker, &token).await;
                            });
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Worker dispatcher");
                            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS))
                        .await;
                }
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) =
                    self.history_store.dequeue_peek_lock(QueueKind::Timer).await
                {
                    match item {
                        WorkItem::TimerSchedule {
                            instance,
                            id,
                            fire_at_ms,
                        } => {
                            match self.timer_mode {
                                TimerMode::Logical => {
                                    let _ = self
                                        .history_store
                                        .enqueue_work(
                                            QueueKind::Orchestrator,
                                            WorkItem::TimerFired {
                                                instance,
                                                id,
                                                fire_at_ms,
                                            },
                                        )
                                        .await;
                                }
                                TimerMode::WallClock => {
                                    let rt = self.clone();
                                    tokio::spawn(async move {
                                        let now = now_wall_ms();
                                        if fire_at_ms > now {
                                            tokio::time::sleep(std::time::Duration::from_millis(
                                                fire_at_ms - now,
                                            ))
                                            .await;
                                        }
                                        let _ = rt
                                            .history_store
                                            .enqueue_work(
                                                QueueKind::Orchestrator,
                                                WorkItem::TimerFired {
                                                    instance,
                                                    id,
                                                    fire_at_ms,
                                                },
                                            )
                                            .await;
                                    });
                                }
                            }
                            let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                        }
                        other => {
                            error!(?other, "unexpected WorkItem in Timer dispatcher");
                            let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS))
                        .await;
                }
            }
        })
    }

    /// Re-enqueue work for schedule events with no recorded completion.
    /// Providers drop duplicate enqueues, so this is safe to run on every
    /// (re)activation.
    async fn rehydrate_pending(&self, instance: &str, history: &[Event]) {
        for e in history {
            match e {
                Event::ActivityScheduled { id, name, input } => {
                    let done = history.iter().any(|h| {
                        matches!(h, Event::ActivityCompleted { id: cid, .. }
                            | Event::ActivityFailed { id: cid, .. } if cid == id)
                    });
                    if !done {
                        let _ = self
                            .history_store
                            .enqueue_work(
                                QueueKind::Worker,
                                WorkItem::ActivityExecute {
                                    instance: instance.to_string(),
                                    id: *id,
                                    name: name.clone(),
                                    input: input.clone(),
                                },
                            )
                            .await;
                    }
                }
                Event::TimerCreated { id, fire_at_ms } => {
                    let fired = history
                        .iter()
                        .any(|h| matches!(h, Event::TimerFired { id: cid, .. } if cid == id));
                    if !fired {
                        let _ = self
                            .history_store
                            .enqueue_work(
                                QueueKind::Timer,
                                WorkItem::TimerSchedule {
                                    instance: instance.to_string(),
                                    id: *id,
                                    fire_at_ms: *fire_at_ms,
                                },
                            )
                            .await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn dispatch_actions(&self, instance: &str, actions: Vec<Action>) {
        for a in actions {
            match a {
                Action::CallActivity { id, name, input } => {
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Worker,
                            WorkItem::ActivityExecute {
                                instance: instance.to_string(),
                                id,
                                name,
                                input,
                            },
                        )
                        .await;
                }
                Action::CreateTimer { id, fire_at_ms } => {
                    let _ = self
                        .history_store
                        .enqueue_work(
                            QueueKind::Timer,
                            WorkItem::TimerSchedule {
                                instance: instance.to_string(),
                                id,
                                fire_at_ms,
                            },
                        )
                        .await;
                }
            }
        }
    }

    async fn notify_waiters(
        &self,
        instance: &str,
        history: &[Event],
        result: &Result<String, String>,
    ) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    /// Run a single instance to completion by orchestration name, returning
    /// its final history and output.
    pub async fn run_instance_to_completion(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
    ) -> (Vec<Event>, Result<String, String>) {
        // Ensure instance not already active in this runtime
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Ensure removal of the active flag and inbox even if the task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                    rt.inboxes.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut history: Vec<Event> = self.history_store.read(instance).await;

        // Register the inbox before rehydrating so redelivered completions land here
        let (tx, mut comp_rx) = mpsc::unbounded_channel::<InstanceMsg>();
        self.inboxes.lock().await.insert(instance.to_string(), tx);

        // Re-enqueue work for anything scheduled but not completed
        self.rehydrate_pending(instance, &history).await;

        // Capture input from the OrchestrationStarted marker
        let current_input: String = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { name, input, .. } if name == orchestration_name => {
                    Some(input.clone())
                }
                _ => None,
            })
            .unwrap_or_default();

        let orchestration_handler = match self.orchestration_registry.get(orchestration_name) {
            Some(h) => h,
            None => {
                let err = format!("unregistered:{orchestration_name}");
                if let Err(e) = self
                    .history_store
                    .append(instance, vec![Event::OrchestrationFailed { error: err.clone() }])
                    .await
                {
                    error!(instance, error = %e, "failed to append OrchestrationFailed for unknown orchestration");
                }
                history.push(Event::OrchestrationFailed { error: err.clone() });
                self.notify_waiters(instance, &history, &Err(err.clone())).await;
                return (history, Err(err));
            }
        };

        let mut turn_index: u64 = 0;
        loop {
            let baseline_len = history.len();
            let handler = orchestration_handler.clone();
            let input = current_input.clone();
            let orchestrator = move |ctx: OrchestrationContext| {
                let h = handler.clone();
                let inp = input.clone();
                async move { h.invoke(ctx, inp).await }
            };
            let (hist_after, actions, _logs, out_opt) =
                run_turn_with(history, turn_index, orchestrator);
            history = hist_after;

            if let Some(out) = out_opt {
                // Persist any deltas produced during this final turn
                if history.len() > baseline_len {
                    let deltas = history[baseline_len..].to_vec();
                    if let Err(e) = self.history_store.append(instance, deltas).await {
                        error!(instance, turn_index, error = %e, "failed to append final turn events");
                        let err = format!("history append failed: {e}");
                        self.notify_waiters(instance, &history, &Err(err.clone())).await;
                        return (history, Err(err));
                    }
                }
                // Persist terminal event based on result
                let term = match &out {
                    Ok(s) => Event::OrchestrationCompleted { output: s.clone() },
                    Err(e) => Event::OrchestrationFailed { error: e.clone() },
                };
                if let Err(e) = self.history_store.append(instance, vec![term.clone()]).await {
                    error!(instance, turn_index, error = %e, "failed to append terminal event");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    return (history, Err(err));
                }
                history.push(term);
                self.notify_waiters(instance, &history, &out).await;
                match &out {
                    Ok(_) => info!(instance, "orchestration completed"),
                    Err(e) => warn!(instance, error = %e, "orchestration failed"),
                }
                return (history, out);
            }

            // Persist newly scheduled events before dispatching their work
            let mut persisted_len = baseline_len;
            if history.len() > persisted_len {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    error!(instance, turn_index, error = %e, "failed to append scheduled events");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    return (history, Err(err));
                }
                persisted_len = history.len();
            }

            self.dispatch_actions(instance, actions).await;

            // Receive at least one completion, or dehydrate on idle timeout
            let first_opt = tokio::time::timeout(
                std::time::Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS),
                comp_rx.recv(),
            )
            .await;
            let first = match first_opt {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    self.inboxes.lock().await.remove(instance);
                    return (history, Ok(String::new()));
                }
                Err(_timeout) => {
                    // Dehydrate only if nothing is waiting on the result
                    let has_waiters = self.result_waiters.lock().await.contains_key(instance);
                    if has_waiters {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            Self::POLLER_IDLE_SLEEP_MS,
                        ))
                        .await;
                        continue;
                    }
                    debug!(instance, "dehydrating idle instance");
                    self.inboxes.lock().await.remove(instance);
                    return (history, Ok(String::new()));
                }
            };

            let mut ack_after_persist: Vec<String> = Vec::new();
            let mut ack_immediate: Vec<String> = Vec::new();
            let len_before_completions = history.len();
            {
                let (token, changed) = append_completion(&mut history, first);
                if let Some(t) = token {
                    if changed {
                        ack_after_persist.push(t);
                    } else {
                        ack_immediate.push(t);
                    }
                }
            }
            for _ in 0..Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => {
                        let (token, changed) = append_completion(&mut history, msg);
                        if let Some(t) = token {
                            if changed {
                                ack_after_persist.push(t);
                            } else {
                                ack_immediate.push(t);
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
            // Ack immediately for messages that changed nothing (duplicates)
            for t in ack_immediate.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            // Persist completions, then ack the peek-locked items
            if history.len() > len_before_completions {
                let new_events = history[persisted_len..].to_vec();
                if let Err(e) = self.history_store.append(instance, new_events).await {
                    error!(instance, turn_index, error = %e, "failed to append completions");
                    let err = format!("history append failed: {e}");
                    self.notify_waiters(instance, &history, &Err(err.clone())).await;
                    return (history, Err(err));
                }
            }
            for t in ack_after_persist.drain(..) {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }

            turn_index = turn_index.saturating_add(1);
        }
    }

    /// Spawn an instance and return a handle that resolves to its history
    /// and output when complete.
    pub fn spawn_instance_to_completion(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
    ) -> JoinHandle<(Vec<Event>, Result<String, String>)> {
        let this_for_task = self.clone();
        let inst = instance.to_string();
        let orch_name = orchestration_name.to_string();
        tokio::spawn(async move { this_for_task.run_instance_to_completion(&inst, &orch_name).await })
    }

    /// Abort background tasks. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    /// Await completion of all outstanding spawned orchestration instances.
    pub async fn drain_instances(self: Arc<Self>) {
        let mut joins = self.instance_joins.lock().await;
        while let Some(j) = joins.pop() {
            let _ = j.await;
        }
    }
}

fn has_terminal(history: &[Event]) -> bool {
    history.iter().any(|e| {
        matches!(
            e,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. }
        )
    })
}

fn completion_in_history(history: &[Event], msg: &InstanceMsg) -> bool {
    match msg {
        InstanceMsg::ActivityCompleted { id, .. } | InstanceMsg::ActivityFailed { id, .. } => {
            history.iter().any(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. }
                    | Event::ActivityFailed { id: cid, .. } if cid == id)
            })
        }
        InstanceMsg::TimerFired { id, .. } => history
            .iter()
            .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if cid == id)),
    }
}

/// Append one completion message to history unless already present.
/// Returns the ack token and whether history changed.
fn append_completion(history: &mut Vec<Event>, msg: InstanceMsg) -> (Option<String>, bool) {
    match msg {
        InstanceMsg::ActivityCompleted { id, result, ack_token } => {
            let dup = history.iter().any(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. }
                    | Event::ActivityFailed { id: cid, .. } if *cid == id)
            });
            if !dup {
                history.push(Event::ActivityCompleted { id, result });
            }
            (ack_token, !dup)
        }
        InstanceMsg::ActivityFailed { id, error, ack_token } => {
            let dup = history.iter().any(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. }
                    | Event::ActivityFailed { id: cid, .. } if *cid == id)
            });
            if !dup {
                history.push(Event::ActivityFailed { id, error });
            }
            (ack_token, !dup)
        }
        InstanceMsg::TimerFired {
            id,
            fire_at_ms,
            ack_token,
        } => {
            let dup = history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id));
            if !dup {
                history.push(Event::TimerFired { id, fire_at_ms });
            }
            (ack_token, !dup)
        }
    }
}
