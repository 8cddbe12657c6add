//! The five workflow activities, bound to the collaborator contracts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use url::Url;

use crate::clients::{
    BlobStore, ExtractError, MessageQueue, ProcessingState, VideoAnalysisService,
};
use crate::config::ExtractionOptions;
use crate::runtime::registry::ActivityRegistryBuilder;
use crate::workflow::message::WorkflowMessage;
use crate::workflow::{
    CHECK_VIDEO_AVAILABLE_ACTIVITY, GET_VIDEO_INDEX_STATUS_ACTIVITY, STORE_INSIGHTS_ACTIVITY,
    UPLOAD_VIDEO_ACTIVITY, WRITE_TO_DATAPROC_QUEUE_ACTIVITY,
};

/// Read-URL lifetime for source videos handed to the analysis service.
const READ_URL_TTL: Duration = Duration::from_secs(2 * 60 * 60);

pub struct ExtractionActivities {
    analysis: Arc<dyn VideoAnalysisService>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn MessageQueue>,
    options: ExtractionOptions,
}

impl ExtractionActivities {
    pub fn new(
        analysis: Arc<dyn VideoAnalysisService>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn MessageQueue>,
        options: ExtractionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            analysis,
            blobs,
            queue,
            options,
        })
    }

    /// Registers the five workflow activities on the given builder.
    pub fn register(self: &Arc<Self>, builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
        let this = self.clone();
        let builder = builder.register_typed(
            CHECK_VIDEO_AVAILABLE_ACTIVITY,
            move |message: WorkflowMessage| {
                let this = this.clone();
                async move {
                    this.check_video_available(&message)
                        .await
                        .map_err(|e| e.to_string())
                }
            },
        );
        let this = self.clone();
        let builder =
            builder.register_typed(UPLOAD_VIDEO_ACTIVITY, move |message: WorkflowMessage| {
                let this = this.clone();
                async move { this.upload_video(&message).await.map_err(|e| e.to_string()) }
            });
        let this = self.clone();
        let builder = builder.register_typed(
            GET_VIDEO_INDEX_STATUS_ACTIVITY,
            move |message: WorkflowMessage| {
                let this = this.clone();
                async move {
                    this.get_video_index_status(&message)
                        .await
                        .map_err(|e| e.to_string())
                }
            },
        );
        let this = self.clone();
        let builder =
            builder.register_typed(STORE_INSIGHTS_ACTIVITY, move |message: WorkflowMessage| {
                let this = this.clone();
                async move {
                    this.store_insights(&message)
                        .await
                        .map_err(|e| e.to_string())
                }
            });
        let this = self.clone();
        builder.register_typed(
            WRITE_TO_DATAPROC_QUEUE_ACTIVITY,
            move |message: WorkflowMessage| {
                let this = this.clone();
                async move {
                    this.write_to_dataproc_queue(&message)
                        .await
                        .map_err(|e| e.to_string())
                }
            },
        )
    }

    /// True iff the source video blob exists. A malformed URI is reported as
    /// "not available" with an error log; infrastructure failures propagate.
    pub async fn check_video_available(
        &self,
        message: &WorkflowMessage,
    ) -> Result<bool, ExtractError> {
        let video_url = message.matching_video_url()?;
        let parsed = match Url::parse(video_url) {
            Ok(u) => u,
            Err(e) => {
                error!(video_url, error = %e, "video uri format seems invalid");
                return Ok(false);
            }
        };
        let exists = self.blobs.exists(&parsed).await?;
        info!(video_url, exists, "checked source video availability");
        Ok(exists)
    }

    /// Uploads the video and returns its analysis-service id. If a video
    /// already exists under the external id, returns that id without
    /// re-uploading.
    pub async fn upload_video(&self, message: &WorkflowMessage) -> Result<String, ExtractError> {
        let video_url = message.matching_video_url()?;
        let video_name = message.matching_video_name()?;
        let video_hash_id = message.video_hash_id()?;
        let language_codes = message.language_codes()?;

        if let Some(existing) = self.analysis.find_by_external_id(video_hash_id).await? {
            info!(video_id = %existing, "video already submitted; reusing id");
            return Ok(existing);
        }

        let parsed = Url::parse(video_url).map_err(|e| ExtractError::InvalidUri {
            uri: video_url.to_string(),
            reason: e.to_string(),
        })?;
        let signed = self.blobs.sign_read_url(&parsed, READ_URL_TTL).await?;

        info!(video_name, "uploading video");
        let video_id = self
            .analysis
            .submit(&signed, video_hash_id, language_codes, video_name)
            .await?;
        info!(video_name, video_id = %video_id, "uploaded video");
        Ok(video_id)
    }

    /// True iff the analysis service reports the video as `Processed`.
    pub async fn get_video_index_status(
        &self,
        message: &WorkflowMessage,
    ) -> Result<bool, ExtractError> {
        let video_id = message.video_id()?;
        let index = self.analysis.get_index(video_id).await?;
        info!(video_id, state = %index.state, "video processing state");
        Ok(index.state == ProcessingState::Processed)
    }

    /// Fetches the insight document and writes it to the silver container.
    /// Returns the destination URL. The processing state is re-checked here;
    /// anything but `Processed` is a hard error and nothing is written.
    pub async fn store_insights(&self, message: &WorkflowMessage) -> Result<String, ExtractError> {
        let video_id = message.video_id()?;
        let video_name = message.matching_video_name()?;
        let destination = self.options.insights_destination(video_name)?;

        let index = self.analysis.get_index(video_id).await?;
        if index.state != ProcessingState::Processed {
            error!(video_id, state = %index.state, "insights not available");
            return Err(ExtractError::InsightsNotReady { state: index.state });
        }

        let payload = serde_json::to_vec(&index.document)
            .map_err(|e| ExtractError::Storage(e.to_string()))?;
        self.blobs.upload(&destination, &payload).await?;
        info!(video_id, destination = %destination, "video insights saved");
        Ok(destination.to_string())
    }

    /// Writes the message verbatim to the dataproc queue and returns it for
    /// confirmation logging.
    pub async fn write_to_dataproc_queue(
        &self,
        message: &WorkflowMessage,
    ) -> Result<WorkflowMessage, ExtractError> {
        info!("writing message to dataproc queue");
        self.queue.enqueue(&message.as_value()).await?;
        Ok(message.clone())
    }
}
