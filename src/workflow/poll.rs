//! Poll a precondition, then run the expensive thing once.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::OrchestrationContext;

/// Calls `available_activity` at a fixed interval until it reports `true`,
/// then runs `main_activity` exactly once through bounded retry and returns
/// its result.
///
/// The deadline is measured on the orchestration's logical clock, so replay
/// after a crash reproduces the same elapsed-time decisions. The
/// availability check itself is not retried: a `false` waits for the next
/// interval, while an error from the check aborts the whole poll. If the
/// resource never becomes available before the deadline, the call fails
/// with `"<available_activity> timed out"` and `main_activity` is never
/// invoked. Once the main activity has started, its retry sequence runs to
/// completion even if it outlives the remaining poll budget.
pub async fn poll_then_run(
    ctx: &OrchestrationContext,
    available_activity: &str,
    main_activity: &str,
    message_json: &str,
    poll_interval: Duration,
    overall_timeout: Duration,
    retry: &RetryPolicy,
) -> Result<String, String> {
    let start_ms = ctx.current_time_ms();
    let deadline_ms = start_ms.saturating_add(overall_timeout.as_millis() as u64);

    while ctx.current_time_ms() < deadline_ms {
        let is_available = ctx
            .schedule_activity(available_activity, message_json)
            .into_activity_typed::<bool>()
            .await?;
        if is_available {
            let result = ctx
                .schedule_activity_with_retry(main_activity, message_json, retry)
                .await?;
            ctx.trace_info(format!("{main_activity} completed with result {result}"));
            return Ok(result);
        }
        // Wait for the next checkpoint
        ctx.schedule_timer(poll_interval.as_millis() as u64)
            .into_timer()
            .await;
    }

    Err(format!("{available_activity} timed out"))
}
