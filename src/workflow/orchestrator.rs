//! The extraction orchestrator: a strict five-stage sequence.

use crate::retry::RetryPolicy;
use crate::workflow::message::WorkflowMessage;
use crate::workflow::poll::poll_then_run;
use crate::workflow::{
    AVAILABILITY_POLL_INTERVAL, CHECK_VIDEO_AVAILABLE_ACTIVITY, GET_VIDEO_INDEX_STATUS_ACTIVITY,
    INDEX_POLL_INTERVAL, POLL_TIMEOUT, STORE_INSIGHTS_ACTIVITY, UPLOAD_VIDEO_ACTIVITY,
    WRITE_TO_DATAPROC_QUEUE_ACTIVITY,
};
use crate::OrchestrationContext;

/// Orchestrates upload and insight extraction for one video, then writes the
/// enriched message to the dataproc queue.
///
/// Input is the inbound video-ready message as JSON; output is the payload
/// that was enqueued downstream. Any stage error is logged with context and
/// re-raised so the runtime records the instance as failed; side effects
/// already performed (an uploaded video, a written insight blob) are left in
/// place.
pub async fn extract_insights(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let mut message = WorkflowMessage::from_json(&input).map_err(|e| e.to_string())?;
    let retry = RetryPolicy::default();

    let result: Result<String, String> = async {
        let video_id = poll_then_run(
            &ctx,
            CHECK_VIDEO_AVAILABLE_ACTIVITY,
            UPLOAD_VIDEO_ACTIVITY,
            &message.to_json(),
            AVAILABILITY_POLL_INTERVAL,
            POLL_TIMEOUT,
            &retry,
        )
        .await?;
        message.set_video_id(video_id);

        let _destination = poll_then_run(
            &ctx,
            GET_VIDEO_INDEX_STATUS_ACTIVITY,
            STORE_INSIGHTS_ACTIVITY,
            &message.to_json(),
            INDEX_POLL_INTERVAL,
            POLL_TIMEOUT,
            &retry,
        )
        .await?;

        let queued = ctx
            .schedule_activity_with_retry(
                WRITE_TO_DATAPROC_QUEUE_ACTIVITY,
                message.to_json(),
                &retry,
            )
            .await?;
        ctx.trace_info(format!(
            "{WRITE_TO_DATAPROC_QUEUE_ACTIVITY} completed with result {queued}"
        ));
        Ok(queued)
    }
    .await;

    if let Err(e) = &result {
        ctx.trace_error(format!(
            "orchestration failed because a child activity produced an error: {e}"
        ));
    }
    result
}
