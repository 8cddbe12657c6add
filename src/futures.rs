//! Unified futures for orchestration primitives.
//!
//! A `DurableFuture` carries a correlation ID that pairs it with its
//! schedule/completion events in history. On the first poll of a turn it
//! records the schedule event and emits the matching `Action`; on later
//! turns the completion is already in history and the future resolves
//! without emitting anything, which is what makes replay deterministic.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::Codec as _;
use crate::OrchestrationContext;

/// Output of a `DurableFuture` when awaited.
#[derive(Debug)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
}

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        delay_ms: u64,
        scheduled: Cell<bool>,
        ctx: OrchestrationContext,
    },
}

/// A future for activities and timers, correlated to history by ID.
pub struct DurableFuture(pub(crate) Kind);

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            Kind::Activity {
                id,
                name,
                input,
                scheduled,
                ctx,
            } => {
                if let Some(outcome) = ctx.find_activity_completion(*id) {
                    return Poll::Ready(DurableOutput::Activity(outcome));
                }
                if !scheduled.get() {
                    ctx.record_activity_scheduled(*id, name, input);
                    scheduled.set(true);
                }
                Poll::Pending
            }
            Kind::Timer {
                id,
                delay_ms,
                scheduled,
                ctx,
            } => {
                if let Some(fire_at_ms) = ctx.find_timer_fired(*id) {
                    // The logical clock moves forward exactly when an awaited
                    // timer resolves.
                    ctx.advance_time(fire_at_ms);
                    return Poll::Ready(DurableOutput::Timer);
                }
                if !scheduled.get() {
                    ctx.record_timer_created(*id, *delay_ms);
                    scheduled.set(true);
                }
                Poll::Pending
            }
        }
    }
}

impl DurableFuture {
    /// Await an activity result as a raw String.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => {
                        panic!("into_activity used on non-activity future: {other:?}")
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an activity result decoded to a typed value.
    pub fn into_activity_typed<Out: serde::de::DeserializeOwned>(
        self,
    ) -> impl Future<Output = Result<Out, String>> {
        async move {
            let raw = Self::into_activity(self).await?;
            crate::_typed_codec::Json::decode::<Out>(&raw)
        }
    }

    /// Resolves when the correlated timer fires.
    pub fn into_timer(self) -> impl Future<Output = ()> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = ();
            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                let this = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
                match this.poll(cx) {
                    Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
                    Poll::Ready(other) => panic!("into_timer used on non-timer future: {other:?}"),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }
}
