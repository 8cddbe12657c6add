//! Workflow entry: start an orchestration per inbound video-ready message.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clients::{ExtractError, TriggerSource};
use crate::runtime::Runtime;
use crate::workflow::message::WorkflowMessage;
use crate::workflow::EXTRACT_INSIGHTS_ORCHESTRATION;

/// Instance id for a video-ready message. Deriving it from the video hash
/// makes duplicate deliveries of the same event converge on one instance.
pub fn instance_id_for(message: &WorkflowMessage) -> Result<String, ExtractError> {
    Ok(format!("extract::{}", message.video_hash_id()?))
}

/// Starts a new extraction orchestration for one inbound message and returns
/// the instance id. Pure delegation; field validation happens in the
/// activities.
pub async fn start_extraction(
    runtime: Arc<Runtime>,
    message: &WorkflowMessage,
) -> Result<String, String> {
    let instance = instance_id_for(message).map_err(|e| e.to_string())?;
    let _handle = runtime
        .start_orchestration(&instance, EXTRACT_INSIGHTS_ORCHESTRATION, message.to_json())
        .await?;
    info!(instance = %instance, "started extraction orchestration");
    Ok(instance)
}

/// Consumes video-ready documents from the trigger source and starts one
/// orchestration per message. Runs until aborted.
pub fn spawn_trigger_listener(
    runtime: Arc<Runtime>,
    source: Arc<dyn TriggerSource>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.next_message().await {
                Ok(Some(value)) => match WorkflowMessage::from_value(value) {
                    Ok(message) => {
                        if let Err(e) = start_extraction(runtime.clone(), &message).await {
                            warn!(error = %e, "failed to start extraction");
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed trigger message"),
                },
                Ok(None) => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    warn!(error = %e, "trigger source receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
    })
}
