//! HTTP client for the video-analysis service.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use super::{ExtractError, VideoAnalysisService, VideoIndex};
use crate::config::AnalysisOptions;

/// A bearer token with its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: SystemTime,
}

/// Where fresh access tokens come from.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken, ExtractError>;
}

/// A fixed token that never needs refreshing; for local wiring and tests.
pub struct StaticTokenSource(pub AccessToken);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(AccessToken {
            token: token.into(),
            expires_at: SystemTime::now() + Duration::from_secs(365 * 24 * 3600),
        })
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<AccessToken, ExtractError> {
        Ok(self.0.clone())
    }
}

/// Single cached credential shared across calls, refreshed lazily when it
/// nears expiry. Guarded by a mutex rather than process-wide static state.
pub struct AccessTokenCache {
    source: Arc<dyn TokenSource>,
    skew: Duration,
    cached: Mutex<Option<AccessToken>>,
}

impl AccessTokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self::with_skew(source, Duration::from_secs(60))
    }

    /// `skew` is subtracted from the expiry so a token is refreshed before
    /// it can expire mid-request.
    pub fn with_skew(source: Arc<dyn TokenSource>, skew: Duration) -> Self {
        Self {
            source,
            skew,
            cached: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<String, ExtractError> {
        let mut guard = self.cached.lock().await;
        if let Some(tok) = guard.as_ref() {
            if SystemTime::now() + self.skew < tok.expires_at {
                return Ok(tok.token.clone());
            }
            debug!("cached access token near expiry; refreshing");
        }
        let fresh = self.source.fetch().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

/// `reqwest`-backed implementation of the analysis-service contract.
pub struct HttpAnalysisClient {
    http: reqwest::Client,
    options: AnalysisOptions,
    tokens: AccessTokenCache,
}

impl HttpAnalysisClient {
    pub fn new(options: AnalysisOptions, tokens: AccessTokenCache) -> Self {
        Self {
            http: reqwest::Client::new(),
            options,
            tokens,
        }
    }

    fn videos_url(&self, suffix: &str) -> Result<Url, ExtractError> {
        let raw = format!(
            "{}/{}/Accounts/{}/Videos{}",
            self.options.api_url.as_str().trim_end_matches('/'),
            self.options.location,
            self.options.account_id,
            suffix
        );
        Url::parse(&raw).map_err(|e| ExtractError::InvalidUri {
            uri: raw,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl VideoAnalysisService for HttpAnalysisClient {
    async fn submit(
        &self,
        video_url: &Url,
        external_id: &str,
        language_codes: &str,
        display_name: &str,
    ) -> Result<String, ExtractError> {
        let token = self.tokens.get().await?;
        let url = self.videos_url("")?;
        info!(external_id, display_name, "submitting video for analysis");
        let response = self
            .http
            .post(url)
            .query(&[
                ("accessToken", token.as_str()),
                ("name", external_id),
                ("description", display_name),
                ("privacy", "Private"),
                ("externalId", external_id),
                ("videoUrl", video_url.as_str()),
                ("language", language_codes),
                ("indexingPreset", "Advanced"),
            ])
            .send()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExtractError::Service(format!(
                "upload returned status {}",
                response.status()
            )));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        info!(video_id = %body.id, "video submitted");
        Ok(body.id)
    }

    async fn get_index(&self, video_id: &str) -> Result<VideoIndex, ExtractError> {
        let token = self.tokens.get().await?;
        let url = self.videos_url(&format!("/{video_id}/Index"))?;
        debug!(video_id, "retrieving video index");
        let response = self
            .http
            .get(url)
            .query(&[("accessToken", token.as_str()), ("language", "English")])
            .send()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ExtractError::Service(format!(
                "get index returned status {}",
                response.status()
            )));
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        VideoIndex::from_document(document)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<String>, ExtractError> {
        let token = self.tokens.get().await?;
        let url = self.videos_url("/GetIdByExternalId")?;
        debug!(external_id, "resolving video id by external id");
        let response = self
            .http
            .get(url)
            .query(&[
                ("accessToken", token.as_str()),
                ("externalId", external_id),
            ])
            .send()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ExtractError::Service(format!(
                "get id by external id returned status {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ExtractError::Service(e.to_string()))?;
        let id = body.trim().trim_matches('"').to_string();
        if id.is_empty() {
            Ok(None)
        } else {
            Ok(Some(id))
        }
    }
}
