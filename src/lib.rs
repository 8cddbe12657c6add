//! Durable video-insights extraction built on a minimal deterministic
//! orchestration core.
//!
//! The crate records append-only `Event`s and replays them to make
//! orchestration logic deterministic across process restarts. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities and
//!   timers using correlation IDs, a replay-stable logical clock, and
//!   bounded activity retry
//! - An in-process `Runtime` with pluggable history stores (`providers`)
//! - The insights-extraction workflow itself (`workflow`) and its
//!   collaborator contracts (`clients`)
use std::cell::Cell;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod clients;
pub mod config;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod workflow;

// Re-export key runtime types for convenience
pub use retry::RetryPolicy;
pub use runtime::{
    OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus,
};

// Internal system activity names
pub(crate) const SYSTEM_TRACE_ACTIVITY: &str = "__system_trace";

use crate::futures::{DurableFuture, Kind};
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O (kept private; public API remains ergonomic)
mod _typed_codec {
    use serde::{de::DeserializeOwned, Serialize};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // If the value is a JSON string, return raw content to keep
            // string-typed activity I/O readable in histories
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            // Try parse as JSON first
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    // Fallback: treat raw string as JSON string value
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Variants use stable correlation IDs to pair
/// scheduling operations with their completions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Orchestration instance was created and started by name with input.
    /// `started_at_ms` seeds the instance's logical clock.
    OrchestrationStarted {
        name: String,
        input: String,
        started_at_ms: u64,
    },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },
    /// Timer was created and will logically fire at `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { id: u64, fire_at_ms: u64 },
}

/// Declarative decisions produced by an orchestration turn. The host/provider
/// is responsible for materializing these into corresponding `Event`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer that will fire at the given logical time.
    CreateTimer { id: u64, fire_at_ms: u64 },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,

    next_correlation_id: u64,

    // Logical clock: seeded by OrchestrationStarted, advanced by fired timers
    logical_now_ms: u64,

    // Logging and turn metadata
    turn_index: u64,
    logging_enabled_this_poll: bool,
    // Per-turn buffered logs (messages to flush once per progress turn)
    log_buffer: Vec<(LogLevel, String)>,

    // Per-turn claimed ids so repeated schedules of the same name/input
    // (retry loops) adopt distinct history entries
    claimed_activity_ids: HashSet<u64>,
    claimed_timer_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        // Compute next correlation id based on max id found in history
        let mut max_id = 0u64;
        let mut started_at_ms = 0u64;
        for ev in &history {
            let id_opt = match ev {
                Event::ActivityScheduled { id, .. }
                | Event::ActivityCompleted { id, .. }
                | Event::ActivityFailed { id, .. }
                | Event::TimerCreated { id, .. }
                | Event::TimerFired { id, .. } => Some(*id),
                Event::OrchestrationStarted {
                    started_at_ms: at, ..
                } => {
                    started_at_ms = *at;
                    None
                }
                Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } => None,
            };
            if let Some(id) = id_opt {
                max_id = max_id.max(id);
            }
        }
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            logical_now_ms: started_at_ms,
            turn_index: 0,
            logging_enabled_this_poll: false,
            log_buffer: Vec::new(),
            claimed_activity_ids: Default::default(),
            claimed_timer_ids: Default::default(),
        }
    }

    fn record_action(&mut self, a: Action) {
        // Scheduling a new action means this poll is producing new decisions
        self.logging_enabled_this_poll = true;
        self.actions.push(a);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history))),
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().unwrap().actions)
    }

    // Turn metadata
    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.inner.lock().unwrap().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.inner.lock().unwrap().turn_index = idx;
    }

    /// Current logical time in milliseconds. Starts at the instance's
    /// `started_at_ms` and moves forward only when an awaited timer fires,
    /// so elapsed-time decisions replay identically after a crash.
    pub fn current_time_ms(&self) -> u64 {
        self.inner.lock().unwrap().logical_now_ms
    }

    // Replay-safe logging control
    /// Indicates whether logging is enabled for the current poll. This is
    /// flipped on when a decision is recorded to minimize log noise.
    pub fn is_logging_enabled(&self) -> bool {
        self.inner.lock().unwrap().logging_enabled_this_poll
    }
    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.inner.lock().unwrap().log_buffer)
    }
    /// Buffer a structured log message for the current turn.
    pub fn push_log(&self, level: LogLevel, msg: String) {
        self.inner.lock().unwrap().log_buffer.push((level, msg));
    }

    /// Emit a structured trace entry using the system trace activity. The
    /// trace is recorded in history, so it runs once and is skipped on replay.
    pub fn trace(&self, level: impl Into<String>, message: impl Into<String>) {
        let payload = format!("{}:{}", level.into(), message.into());
        let mut fut = self.schedule_activity(crate::SYSTEM_TRACE_ACTIVITY, payload);
        let _ = poll_once(&mut fut);
    }

    /// Convenience wrapper for INFO level tracing.
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }
    /// Convenience wrapper for WARN level tracing.
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }
    /// Convenience wrapper for ERROR level tracing.
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }
    /// Convenience wrapper for DEBUG level tracing.
    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }
}

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.inner.lock().unwrap();
        // Try to adopt an existing scheduled activity id that matches and isn't claimed yet
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityScheduled {
                    id,
                    name: n,
                    input: inp,
                } if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) => {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Activity {
            id: adopted_id,
            name,
            input,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes input and later decodes output via `into_activity_typed`.
    pub fn schedule_activity_typed<In: serde::Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> DurableFuture {
        use crate::_typed_codec::Codec as _;
        let payload = crate::_typed_codec::Json::encode(input).expect("encode");
        self.schedule_activity(name, payload)
    }

    /// Schedule a timer and return a `DurableFuture` correlated to it.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let mut inner = self.inner.lock().unwrap();
        // Adopt first unclaimed TimerCreated id if any, else allocate
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::TimerCreated { id, .. } if !inner.claimed_timer_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_timer_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id: adopted_id,
            delay_ms,
            scheduled: Cell::new(false),
            ctx: self.clone(),
        })
    }

    // ---- helpers used by DurableFuture polling ----

    pub(crate) fn find_activity_completion(&self, id: u64) -> Option<Result<String, String>> {
        let inner = self.inner.lock().unwrap();
        for e in inner.history.iter() {
            match e {
                Event::ActivityCompleted { id: cid, result } if *cid == id => {
                    return Some(Ok(result.clone()))
                }
                Event::ActivityFailed { id: cid, error } if *cid == id => {
                    return Some(Err(error.clone()))
                }
                _ => {}
            }
        }
        None
    }

    pub(crate) fn record_activity_scheduled(&self, id: u64, name: &str, input: &str) {
        let mut inner = self.inner.lock().unwrap();
        let already = inner
            .history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id));
        if !already {
            inner.history.push(Event::ActivityScheduled {
                id,
                name: name.to_string(),
                input: input.to_string(),
            });
            inner.record_action(Action::CallActivity {
                id,
                name: name.to_string(),
                input: input.to_string(),
            });
        }
    }

    pub(crate) fn find_timer_fired(&self, id: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().find_map(|e| match e {
            Event::TimerFired { id: cid, fire_at_ms } if *cid == id => Some(*fire_at_ms),
            _ => None,
        })
    }

    pub(crate) fn record_timer_created(&self, id: u64, delay_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        let already = inner
            .history
            .iter()
            .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id));
        if !already {
            let fire_at_ms = inner.logical_now_ms.saturating_add(delay_ms);
            inner.history.push(Event::TimerCreated { id, fire_at_ms });
            inner.record_action(Action::CreateTimer { id, fire_at_ms });
        }
    }

    pub(crate) fn advance_time(&self, to_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.logical_now_ms = inner.logical_now_ms.max(to_ms);
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let w = noop_waker();
    let mut cx = Context::from_waker(&w);
    let mut pinned = unsafe { Pin::new_unchecked(fut) };
    pinned.as_mut().poll(&mut cx)
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once with the provided history, producing
/// updated history, requested `Action`s, buffered logs, and an optional output.
pub fn run_turn<O, F>(
    history: Vec<Event>,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a caller-supplied
/// turn index for diagnostics and logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(history);
    ctx.set_turn_index(turn_index);
    ctx.inner.lock().unwrap().logging_enabled_this_poll = false;
    let mut fut = orchestrator(ctx.clone());
    match poll_once(&mut fut) {
        Poll::Ready(out) => {
            ctx.inner.lock().unwrap().logging_enabled_this_poll = true;
            let logs = ctx.take_log_buffer();
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            (hist_after, actions, logs, Some(out))
        }
        Poll::Pending => {
            let actions = ctx.take_actions();
            let hist_after = ctx.inner.lock().unwrap().history.clone();
            let logs = ctx.take_log_buffer();
            (hist_after, actions, logs, None)
        }
    }
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}
