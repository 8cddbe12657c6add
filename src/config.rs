//! Configuration for the extraction workflow and its collaborators.

use std::env;

use serde::Deserialize;
use url::Url;

use crate::clients::ExtractError;

/// Storage layout for extracted insights.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionOptions {
    /// Root of the data storage account; expected to end with `/`.
    pub data_storage_uri: Url,
    /// Container holding the raw source videos.
    pub bronze_container: String,
    /// Container receiving extracted insight documents.
    pub silver_container: String,
}

impl ExtractionOptions {
    /// Reads `DATA_STORAGE_URI`, `BRONZE_CONTAINER_NAME` and
    /// `SILVER_CONTAINER_NAME`.
    pub fn from_env() -> Result<Self, ExtractError> {
        let raw = require_env("DATA_STORAGE_URI")?;
        let data_storage_uri = Url::parse(&raw).map_err(|e| ExtractError::InvalidUri {
            uri: raw,
            reason: e.to_string(),
        })?;
        Ok(Self {
            data_storage_uri,
            bronze_container: require_env("BRONZE_CONTAINER_NAME")?,
            silver_container: require_env("SILVER_CONTAINER_NAME")?,
        })
    }

    /// Destination for a video's insight document:
    /// `{data_storage_uri}{silver_container}/{name without extension}/vi_insights.json`.
    pub fn insights_destination(&self, video_name: &str) -> Result<Url, ExtractError> {
        let folder = video_name.split('.').next().unwrap_or(video_name);
        let raw = format!(
            "{}{}/{}/vi_insights.json",
            self.data_storage_uri, self.silver_container, folder
        );
        Url::parse(&raw).map_err(|e| ExtractError::InvalidUri {
            uri: raw,
            reason: e.to_string(),
        })
    }
}

/// Endpoint coordinates for the analysis-service API.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisOptions {
    pub api_url: Url,
    pub account_id: String,
    pub location: String,
}

impl AnalysisOptions {
    /// Reads `VIDEO_ANALYSIS_API_URL`, `VIDEO_ANALYSIS_ACCOUNT_ID` and
    /// `VIDEO_ANALYSIS_LOCATION`.
    pub fn from_env() -> Result<Self, ExtractError> {
        let raw = require_env("VIDEO_ANALYSIS_API_URL")?;
        let api_url = Url::parse(&raw).map_err(|e| ExtractError::InvalidUri {
            uri: raw,
            reason: e.to_string(),
        })?;
        Ok(Self {
            api_url,
            account_id: require_env("VIDEO_ANALYSIS_ACCOUNT_ID")?,
            location: require_env("VIDEO_ANALYSIS_LOCATION")?,
        })
    }
}

fn require_env(name: &str) -> Result<String, ExtractError> {
    env::var(name).map_err(|_| ExtractError::Config(format!("{name} is not set")))
}
