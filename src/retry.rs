//! Bounded automatic retry for activity invocations.
//!
//! Every activity failure is treated as transient until attempts are
//! exhausted; there is no per-error-kind exclusion. Spacing is a fixed
//! interval (not exponential): each failed attempt waits
//! `first_retry_interval` on a durable timer before the next try, so the
//! whole retry sequence is recorded in history and replays deterministically.

use std::time::Duration;

use crate::OrchestrationContext;

/// Retry parameters applied around exactly one activity call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between attempts.
    pub first_retry_interval: Duration,
    /// Total number of attempts, including the first (must be >= 1).
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(first_retry_interval: Duration, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "retry policy needs at least one attempt");
        Self {
            first_retry_interval,
            max_attempts,
        }
    }
}

impl Default for RetryPolicy {
    /// 30 seconds between attempts, 5 attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 5)
    }
}

impl OrchestrationContext {
    /// Calls the activity up to `policy.max_attempts` times, waiting
    /// `policy.first_retry_interval` on a durable timer between attempts.
    /// Returns the first success, or the last failure annotated with the
    /// attempt count once attempts are exhausted.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<String, String> {
        let name: String = name.into();
        let input: String = input.into();
        let mut attempt = 1u32;
        loop {
            match self
                .schedule_activity(name.as_str(), input.as_str())
                .into_activity()
                .await
            {
                Ok(result) => return Ok(result),
                Err(error) if attempt >= policy.max_attempts => {
                    return Err(format!("{name} failed after {attempt} attempts: {error}"));
                }
                Err(error) => {
                    self.trace_warn(format!(
                        "{name} attempt {attempt} failed: {error}; retrying"
                    ));
                    self.schedule_timer(policy.first_retry_interval.as_millis() as u64)
                        .into_timer()
                        .await;
                    attempt += 1;
                }
            }
        }
    }
}
