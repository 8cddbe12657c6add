//! Filesystem-backed blob store.
//!
//! Blob URLs map under a root directory as `{root}/{host}/{path}`, so the
//! same `https://storage/container/name` addressing the workflow uses in
//! production resolves to local files in development and tests.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs;
use url::Url;

use super::{BlobStore, ExtractError};

#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, url: &Url) -> PathBuf {
        let mut path = self.root.clone();
        if let Some(host) = url.host_str() {
            path.push(host);
        }
        for seg in url.path_segments().into_iter().flatten() {
            // keep traversal segments out of the mapped path
            if seg.is_empty() || seg == "." || seg == ".." {
                continue;
            }
            path.push(seg);
        }
        path
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, url: &Url) -> Result<bool, ExtractError> {
        let path = self.path_for(url);
        fs::try_exists(&path)
            .await
            .map_err(|e| ExtractError::Storage(e.to_string()))
    }

    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<(), ExtractError> {
        let path = self.path_for(url);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ExtractError::Storage(e.to_string()))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| ExtractError::Storage(e.to_string()))
    }

    async fn sign_read_url(&self, url: &Url, ttl: Duration) -> Result<Url, ExtractError> {
        if !self.exists(url).await? {
            return Err(ExtractError::Storage(format!("blob not found: {url}")));
        }
        let expires = (SystemTime::now() + ttl)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut hasher = DefaultHasher::new();
        url.path().hash(&mut hasher);
        expires.hash(&mut hasher);
        let mut signed = url.clone();
        signed
            .query_pairs_mut()
            .append_pair("sp", "r")
            .append_pair("se", &expires.to_string())
            .append_pair("sig", &format!("{:016x}", hasher.finish()));
        Ok(signed)
    }
}
