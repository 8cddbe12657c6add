use crate::_typed_codec::Codec;
use crate::Event;

use super::Runtime;

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl Runtime {
    /// Current status of an instance, derived from its stored history.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        let hist = self.history_store.read(instance).await;
        if hist.is_empty() {
            return OrchestrationStatus::NotFound;
        }
        for e in hist.iter().rev() {
            match e {
                Event::OrchestrationCompleted { output } => {
                    return OrchestrationStatus::Completed {
                        output: output.clone(),
                    }
                }
                Event::OrchestrationFailed { error } => {
                    return OrchestrationStatus::Failed {
                        error: error.clone(),
                    }
                }
                _ => {}
            }
        }
        OrchestrationStatus::Running
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed)
    /// or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        // quick path
        match self.get_orchestration_status(instance).await {
            OrchestrationStatus::Completed { output } => {
                return Ok(OrchestrationStatus::Completed { output })
            }
            OrchestrationStatus::Failed { error } => {
                return Ok(OrchestrationStatus::Failed { error })
            }
            _ => {}
        }
        // poll with backoff
        let mut delay_ms: u64 = 5;
        while std::time::Instant::now() < deadline {
            match self.get_orchestration_status(instance).await {
                OrchestrationStatus::Completed { output } => {
                    return Ok(OrchestrationStatus::Completed { output })
                }
                OrchestrationStatus::Failed { error } => {
                    return Ok(OrchestrationStatus::Failed { error })
                }
                _ => {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(100);
                }
            }
        }
        Err(WaitError::Timeout)
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output,
    /// Ok(Err(String)) on Failed.
    pub async fn wait_for_orchestration_typed<Out: serde::de::DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => {
                match crate::_typed_codec::Json::decode::<Out>(&output) {
                    Ok(v) => Ok(Ok(v)),
                    Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
                }
            }
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            _ => unreachable!("wait_for_orchestration returns only terminal or timeout"),
        }
    }
}
