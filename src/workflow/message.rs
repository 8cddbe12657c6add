//! The message that travels through the whole orchestration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clients::ExtractError;

/// An order-preserving JSON object that accumulates fields as the workflow
/// progresses. Required on arrival: `matching_video_url`,
/// `matching_video_name`, `video_hash_id`, `language_codes`. The
/// orchestrator adds `video_id` exactly once after upload; activities never
/// mutate the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowMessage {
    fields: Map<String, Value>,
}

impl WorkflowMessage {
    pub fn from_value(value: Value) -> Result<Self, ExtractError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ExtractError::InvalidMessage(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ExtractError> {
        let value = serde_json::from_str::<Value>(raw)
            .map_err(|e| ExtractError::InvalidMessage(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).expect("workflow message serializes")
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    fn require_str(&self, field: &'static str) -> Result<&str, ExtractError> {
        self.fields
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ExtractError::MissingField(field))
    }

    /// Absolute URI of the source video blob.
    pub fn matching_video_url(&self) -> Result<&str, ExtractError> {
        self.require_str("matching_video_url")
    }

    /// Display name of the video, e.g. `clip.mp4`.
    pub fn matching_video_name(&self) -> Result<&str, ExtractError> {
        self.require_str("matching_video_name")
    }

    /// External id used to detect an already-submitted video.
    pub fn video_hash_id(&self) -> Result<&str, ExtractError> {
        self.require_str("video_hash_id")
    }

    pub fn language_codes(&self) -> Result<&str, ExtractError> {
        self.require_str("language_codes")
    }

    /// Analysis-service id; present once the upload stage has run.
    pub fn video_id(&self) -> Result<&str, ExtractError> {
        self.require_str("video_id")
    }

    pub fn set_video_id(&mut self, video_id: impl Into<String>) {
        self.fields
            .insert("video_id".into(), Value::String(video_id.into()));
    }
}
