//! Collaborator contracts consumed by the extraction workflow.
//!
//! The analysis service, blob store, message queue and trigger source are
//! external, multi-tenant systems; the workflow only depends on the narrow
//! contracts below. Implementations live in the submodules: an HTTP client
//! for the analysis service and filesystem/in-memory stand-ins for storage
//! and queues.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub mod analysis;
pub mod blob;
pub mod queue;

pub use analysis::{AccessToken, AccessTokenCache, HttpAnalysisClient, StaticTokenSource, TokenSource};
pub use blob::FsBlobStore;
pub use queue::{FsMessageQueue, InMemoryMessageQueue};

/// Errors surfaced by the workflow and its collaborators.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid workflow message: {0}")]
    InvalidMessage(String),
    #[error("invalid uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("analysis service request failed: {0}")]
    Service(String),
    #[error("blob storage request failed: {0}")]
    Storage(String),
    #[error("queue write failed: {0}")]
    Queue(String),
    #[error("access token acquisition failed: {0}")]
    Token(String),
    /// The insight document was requested while the video is not in the
    /// `Processed` state. Retrying will not fix this; the caller's
    /// precondition check was stale.
    #[error("insights not available: video state is {state}")]
    InsightsNotReady { state: ProcessingState },
}

/// Processing state reported by the analysis service for a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl ProcessingState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Uploaded" => Some(ProcessingState::Uploaded),
            "Processing" => Some(ProcessingState::Processing),
            "Processed" => Some(ProcessingState::Processed),
            "Failed" => Some(ProcessingState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Uploaded => "Uploaded",
            ProcessingState::Processing => "Processing",
            ProcessingState::Processed => "Processed",
            ProcessingState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video's full index document plus its parsed processing state.
///
/// `document` is the raw insight payload as returned by the service; it is
/// persisted verbatim by the store-insights activity.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoIndex {
    pub state: ProcessingState,
    pub document: Value,
}

impl VideoIndex {
    /// Builds an index from the raw document, reading its `state` field.
    pub fn from_document(document: Value) -> Result<Self, ExtractError> {
        let state = document
            .get("state")
            .and_then(Value::as_str)
            .and_then(ProcessingState::parse)
            .ok_or_else(|| {
                ExtractError::Service("index document has no parsable state field".into())
            })?;
        Ok(Self { state, document })
    }
}

/// Remote video-analysis service.
#[async_trait]
pub trait VideoAnalysisService: Send + Sync {
    /// Submits a video by URL and starts analysis; returns the new video id.
    async fn submit(
        &self,
        video_url: &Url,
        external_id: &str,
        language_codes: &str,
        display_name: &str,
    ) -> Result<String, ExtractError>;

    /// Fetches the index document (state + insights) for a video.
    async fn get_index(&self, video_id: &str) -> Result<VideoIndex, ExtractError>;

    /// Resolves a previously submitted video by its external id.
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<String>, ExtractError>;
}

/// Blob storage holding source videos and extracted insights.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, url: &Url) -> Result<bool, ExtractError>;
    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<(), ExtractError>;
    /// Issues a read-only URL for the blob, valid for `ttl`.
    async fn sign_read_url(&self, url: &Url, ttl: Duration) -> Result<Url, ExtractError>;
}

/// Outbound queue for the downstream data-processing stage.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, payload: &Value) -> Result<(), ExtractError>;
}

/// Inbound source of video-ready documents, delivered at least once.
#[async_trait]
pub trait TriggerSource: Send + Sync {
    /// Next pending document, or `None` when nothing is currently available.
    async fn next_message(&self) -> Result<Option<Value>, ExtractError>;
}
