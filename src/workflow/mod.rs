//! The insights-extraction workflow.
//!
//! One orchestration instance per inbound video-ready message drives:
//! wait for the source video blob -> upload to the analysis service ->
//! wait for processing to finish -> persist the insight document ->
//! enqueue the enriched message downstream. Stages run strictly in order;
//! any unhandled failure ends the instance in a failed state with no
//! compensation of side effects already performed.

use std::sync::Arc;
use std::time::Duration;

pub mod activities;
pub mod message;
pub mod orchestrator;
pub mod poll;
pub mod trigger;

pub use activities::ExtractionActivities;
pub use message::WorkflowMessage;

use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};

/// Orchestration and activity names.
pub const EXTRACT_INSIGHTS_ORCHESTRATION: &str = "ExtractInsights";
pub const CHECK_VIDEO_AVAILABLE_ACTIVITY: &str = "CheckVideoAvailable";
pub const UPLOAD_VIDEO_ACTIVITY: &str = "UploadVideo";
pub const GET_VIDEO_INDEX_STATUS_ACTIVITY: &str = "GetVideoIndexStatus";
pub const STORE_INSIGHTS_ACTIVITY: &str = "StoreInsights";
pub const WRITE_TO_DATAPROC_QUEUE_ACTIVITY: &str = "WriteToDataProcQueue";

/// Source-video availability is checked every 30 seconds.
pub const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Processing state is checked every 150 seconds.
pub const INDEX_POLL_INTERVAL: Duration = Duration::from_secs(150);
/// Each polling phase gives up after two hours.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(120 * 60);

/// Registry containing the extraction orchestrator.
pub fn orchestration_registry() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(EXTRACT_INSIGHTS_ORCHESTRATION, orchestrator::extract_insights)
        .build()
}

/// Registry containing the five workflow activities bound to the given
/// collaborators.
pub fn activity_registry(activities: &Arc<ExtractionActivities>) -> ActivityRegistry {
    activities.register(ActivityRegistry::builder()).build()
}
