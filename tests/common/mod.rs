#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use insight_extract::clients::{
    BlobStore, ExtractError, ProcessingState, VideoAnalysisService, VideoIndex,
};
use insight_extract::config::ExtractionOptions;
use insight_extract::providers::HistoryStore;
use insight_extract::workflow::WorkflowMessage;
use insight_extract::Event;

/// Poll the store until the predicate holds or the timeout elapses.
pub async fn wait_for_history(
    store: Arc<dyn HistoryStore>,
    instance: &str,
    pred: impl Fn(&[Event]) -> bool,
    timeout_ms: u64,
) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

pub fn sample_message() -> WorkflowMessage {
    WorkflowMessage::from_json(
        r#"{"matching_video_url":"https://datastore.example.net/bronze/test.mp4","matching_video_name":"test.mp4","video_hash_id":"abc123","language_codes":"en"}"#,
    )
    .unwrap()
}

pub fn sample_options() -> ExtractionOptions {
    ExtractionOptions {
        data_storage_uri: Url::parse("https://datastore.example.net/").unwrap(),
        bronze_container: "bronze".to_string(),
        silver_container: "silver".to_string(),
    }
}

/// Analysis-service double with scripted state and call counters.
pub struct ScriptedAnalysis {
    pub by_external: Mutex<HashMap<String, String>>,
    pub state: Mutex<ProcessingState>,
    /// When non-empty, `get_index` consumes one state per call; the last
    /// entry is sticky once the sequence runs dry.
    pub state_sequence: Mutex<Vec<ProcessingState>>,
    pub next_video_id: String,
    pub submit_calls: AtomicUsize,
    pub find_calls: AtomicUsize,
    pub index_calls: AtomicUsize,
    pub call_log: Mutex<Vec<String>>,
}

impl ScriptedAnalysis {
    pub fn new(next_video_id: &str, state: ProcessingState) -> Arc<Self> {
        Arc::new(Self {
            by_external: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            state_sequence: Mutex::new(Vec::new()),
            next_video_id: next_video_id.to_string(),
            submit_calls: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
            index_calls: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        })
    }

    /// Scripts the state reported by successive `get_index` calls.
    pub fn with_state_sequence(self: Arc<Self>, states: Vec<ProcessingState>) -> Arc<Self> {
        *self.state_sequence.lock().unwrap() = states;
        self
    }

    pub fn with_existing(self: Arc<Self>, external_id: &str, video_id: &str) -> Arc<Self> {
        self.by_external
            .lock()
            .unwrap()
            .insert(external_id.to_string(), video_id.to_string());
        self
    }

    pub fn set_state(&self, state: ProcessingState) {
        *self.state.lock().unwrap() = state;
    }

    fn current_state(&self) -> ProcessingState {
        let mut seq = self.state_sequence.lock().unwrap();
        if seq.is_empty() {
            *self.state.lock().unwrap()
        } else if seq.len() == 1 {
            seq[0]
        } else {
            seq.remove(0)
        }
    }

    pub fn index_document(&self, video_id: &str) -> Value {
        let state = if self.state_sequence.lock().unwrap().is_empty() {
            *self.state.lock().unwrap()
        } else {
            *self.state_sequence.lock().unwrap().last().unwrap()
        };
        json!({
            "id": video_id,
            "state": state.as_str(),
            "videos": [{"id": video_id, "insights": {"transcript": []}}]
        })
    }
}

#[async_trait]
impl VideoAnalysisService for ScriptedAnalysis {
    async fn submit(
        &self,
        video_url: &Url,
        external_id: &str,
        _language_codes: &str,
        _display_name: &str,
    ) -> Result<String, ExtractError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.lock().unwrap().push(format!("submit:{video_url}"));
        self.by_external
            .lock()
            .unwrap()
            .insert(external_id.to_string(), self.next_video_id.clone());
        Ok(self.next_video_id.clone())
    }

    async fn get_index(&self, video_id: &str) -> Result<VideoIndex, ExtractError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.current_state();
        Ok(VideoIndex {
            state,
            document: json!({
                "id": video_id,
                "state": state.as_str(),
                "videos": [{"id": video_id, "insights": {"transcript": []}}]
            }),
        })
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<String>, ExtractError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.lock().unwrap().push("find_by_external_id".to_string());
        Ok(self.by_external.lock().unwrap().get(external_id).cloned())
    }
}

/// Blob-store double backed by a map of URL -> bytes.
#[derive(Default)]
pub struct MemoryBlobStore {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub available: AtomicBool,
    pub fail_exists: AtomicBool,
    pub sign_calls: AtomicUsize,
    pub exists_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub call_log: Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new(available: bool) -> Arc<Self> {
        let store = Self::default();
        store.available.store(available, Ordering::SeqCst);
        Arc::new(store)
    }

    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(url).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, _url: &Url) -> Result<bool, ExtractError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(ExtractError::Storage("storage unavailable".into()));
        }
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn upload(&self, url: &Url, bytes: &[u8]) -> Result<(), ExtractError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn sign_read_url(
        &self,
        url: &Url,
        _ttl: std::time::Duration,
    ) -> Result<Url, ExtractError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        self.call_log.lock().unwrap().push("sign_read_url".to_string());
        let mut signed = url.clone();
        signed.set_query(Some("sp=r&sig=test"));
        Ok(signed)
    }
}
