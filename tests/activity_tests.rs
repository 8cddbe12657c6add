//! Activity behavior against mocked collaborators, plus message, token-cache
//! and configuration checks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;

use url::Url;

use insight_extract::clients::{
    AccessToken, AccessTokenCache, BlobStore as _, ExtractError, FsBlobStore, FsMessageQueue,
    InMemoryMessageQueue, MessageQueue as _, ProcessingState, StaticTokenSource, TokenSource,
    TriggerSource as _,
};
use insight_extract::config::ExtractionOptions;
use insight_extract::workflow::{ExtractionActivities, WorkflowMessage};

mod common;
use common::{sample_message, sample_options, MemoryBlobStore, ScriptedAnalysis};

fn make_activities(
    analysis: Arc<ScriptedAnalysis>,
    blobs: Arc<MemoryBlobStore>,
    queue: Arc<InMemoryMessageQueue>,
) -> Arc<ExtractionActivities> {
    ExtractionActivities::new(analysis, blobs, queue, sample_options())
}

#[tokio::test]
async fn missing_required_fields_fail_fast() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Processed);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis.clone(), blobs.clone(), queue);

    let empty = WorkflowMessage::from_json("{}").unwrap();
    match activities.check_video_available(&empty).await {
        Err(ExtractError::MissingField("matching_video_url")) => {}
        other => panic!("expected missing matching_video_url, got {other:?}"),
    }
    match activities.upload_video(&empty).await {
        Err(ExtractError::MissingField("matching_video_url")) => {}
        other => panic!("expected missing matching_video_url, got {other:?}"),
    }
    match activities.get_video_index_status(&empty).await {
        Err(ExtractError::MissingField("video_id")) => {}
        other => panic!("expected missing video_id, got {other:?}"),
    }
    match activities.store_insights(&empty).await {
        Err(ExtractError::MissingField("video_id")) => {}
        other => panic!("expected missing video_id, got {other:?}"),
    }
    // No collaborator was touched
    assert_eq!(analysis.find_calls.load(Ordering::SeqCst), 0);
    assert_eq!(analysis.index_calls.load(Ordering::SeqCst), 0);
    assert_eq!(blobs.exists_calls.load(Ordering::SeqCst), 0);

    // A blank value counts as missing too
    let blank = WorkflowMessage::from_json(r#"{"matching_video_url":"  "}"#).unwrap();
    assert!(matches!(
        activities.check_video_available(&blank).await,
        Err(ExtractError::MissingField("matching_video_url"))
    ));
}

#[tokio::test]
async fn check_video_available_reports_blob_existence() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Uploaded);
    let blobs = MemoryBlobStore::new(false);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis, blobs.clone(), queue);

    let message = sample_message();
    assert!(!activities.check_video_available(&message).await.unwrap());

    blobs.available.store(true, Ordering::SeqCst);
    assert!(activities.check_video_available(&message).await.unwrap());
}

// A malformed source URI reports "not available" rather than raising; a
// storage failure propagates.
#[tokio::test]
async fn check_video_available_edge_cases() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Uploaded);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis, blobs.clone(), queue);

    let bad_uri = WorkflowMessage::from_json(
        r#"{"matching_video_url":"not a uri","matching_video_name":"test.mp4","video_hash_id":"abc123","language_codes":"en"}"#,
    )
    .unwrap();
    assert!(!activities.check_video_available(&bad_uri).await.unwrap());
    assert_eq!(blobs.exists_calls.load(Ordering::SeqCst), 0);

    blobs.fail_exists.store(true, Ordering::SeqCst);
    let message = sample_message();
    assert!(matches!(
        activities.check_video_available(&message).await,
        Err(ExtractError::Storage(_))
    ));
}

// Idempotent upload: an existing external id short-circuits and the service
// is never asked to index again.
#[tokio::test]
async fn upload_video_reuses_existing_external_id() {
    let analysis =
        ScriptedAnalysis::new("vid-new", ProcessingState::Uploaded).with_existing("abc123", "vid-42");
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis.clone(), blobs.clone(), queue);

    let video_id = activities.upload_video(&sample_message()).await.unwrap();
    assert_eq!(video_id, "vid-42");
    assert_eq!(analysis.submit_calls.load(Ordering::SeqCst), 0);
    assert_eq!(blobs.sign_calls.load(Ordering::SeqCst), 0);
}

// New upload: sign a read URL, then submit it; the id of the submitted video
// comes back.
#[tokio::test]
async fn upload_video_signs_then_submits() {
    let analysis = ScriptedAnalysis::new("vid-7", ProcessingState::Uploaded);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis.clone(), blobs.clone(), queue);

    let video_id = activities.upload_video(&sample_message()).await.unwrap();
    assert_eq!(video_id, "vid-7");
    assert_eq!(blobs.sign_calls.load(Ordering::SeqCst), 1);
    assert_eq!(analysis.submit_calls.load(Ordering::SeqCst), 1);
    // The URL handed to the service is the signed one
    let log = analysis.call_log.lock().unwrap().clone();
    let submit_entry = log
        .iter()
        .find(|l| l.starts_with("submit:"))
        .expect("submit was called");
    assert!(
        submit_entry.contains("sig=test"),
        "submit must receive the signed read URL, got {submit_entry}"
    );
}

#[tokio::test]
async fn get_video_index_status_checks_processed_state() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Processing);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis.clone(), blobs, queue);

    let mut message = sample_message();
    message.set_video_id("vid-1");

    assert!(!activities.get_video_index_status(&message).await.unwrap());
    analysis.set_state(ProcessingState::Processed);
    assert!(activities.get_video_index_status(&message).await.unwrap());
}

// StoreInsights on a processed video writes exactly one blob whose content is
// the fetched index document and returns the derived destination path.
#[tokio::test]
async fn store_insights_writes_document_to_destination() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Processed);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis.clone(), blobs.clone(), queue);

    let mut message = sample_message();
    message.set_video_id("vid-1");

    let destination = activities.store_insights(&message).await.unwrap();
    assert_eq!(
        destination,
        "https://datastore.example.net/silver/test/vi_insights.json"
    );
    assert_eq!(blobs.upload_calls.load(Ordering::SeqCst), 1);
    let stored = blobs.blob(&destination).expect("insights blob written");
    let stored_doc: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    assert_eq!(stored_doc, analysis.index_document("vid-1"));
}

// StoreInsights with a state other than Processed raises the
// state-inconsistency error and writes nothing.
#[tokio::test]
async fn store_insights_rejects_unprocessed_states() {
    for state in [
        ProcessingState::Uploaded,
        ProcessingState::Processing,
        ProcessingState::Failed,
    ] {
        let analysis = ScriptedAnalysis::new("vid-1", state);
        let blobs = MemoryBlobStore::new(true);
        let queue = Arc::new(InMemoryMessageQueue::new());
        let activities = make_activities(analysis, blobs.clone(), queue);

        let mut message = sample_message();
        message.set_video_id("vid-1");

        match activities.store_insights(&message).await {
            Err(ExtractError::InsightsNotReady { state: got }) => assert_eq!(got, state),
            other => panic!("expected InsightsNotReady for {state}, got {other:?}"),
        }
        assert_eq!(blobs.upload_calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn write_to_dataproc_queue_enqueues_verbatim() {
    let analysis = ScriptedAnalysis::new("vid-1", ProcessingState::Processed);
    let blobs = MemoryBlobStore::new(true);
    let queue = Arc::new(InMemoryMessageQueue::new());
    let activities = make_activities(analysis, blobs, queue.clone());

    let mut message = sample_message();
    message.set_video_id("vid-1");

    let echoed = activities.write_to_dataproc_queue(&message).await.unwrap();
    assert_eq!(echoed, message);
    let queued = queue.snapshot().await;
    assert_eq!(queued, vec![message.as_value()]);
}

struct CountingTokenSource {
    fetches: AtomicUsize,
    ttl: Duration,
}

#[async_trait::async_trait]
impl TokenSource for CountingTokenSource {
    async fn fetch(&self) -> Result<AccessToken, ExtractError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AccessToken {
            token: format!("token-{n}"),
            expires_at: SystemTime::now() + self.ttl,
        })
    }
}

// A valid cached token is reused; a token near expiry triggers exactly one
// refresh.
#[tokio::test]
async fn token_cache_refreshes_lazily() {
    let source = Arc::new(CountingTokenSource {
        fetches: AtomicUsize::new(0),
        ttl: Duration::from_secs(3600),
    });
    let cache = AccessTokenCache::new(source.clone());
    assert_eq!(cache.get().await.unwrap(), "token-1");
    assert_eq!(cache.get().await.unwrap(), "token-1");
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    let fixed = AccessTokenCache::new(Arc::new(StaticTokenSource::new("fixed")));
    assert_eq!(fixed.get().await.unwrap(), "fixed");

    // Tokens that expire inside the skew window are refreshed on every get
    let short = Arc::new(CountingTokenSource {
        fetches: AtomicUsize::new(0),
        ttl: Duration::from_secs(10),
    });
    let cache = AccessTokenCache::with_skew(short.clone(), Duration::from_secs(60));
    assert_eq!(cache.get().await.unwrap(), "token-1");
    assert_eq!(cache.get().await.unwrap(), "token-2");
    assert_eq!(short.fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn workflow_message_preserves_field_order() {
    let raw = r#"{"matching_video_url":"https://h/c/v.mp4","matching_video_name":"v.mp4","video_hash_id":"h1","language_codes":"en"}"#;
    let mut message = WorkflowMessage::from_json(raw).unwrap();
    assert_eq!(message.to_json(), raw);
    message.set_video_id("vid-1");
    assert_eq!(
        message.to_json(),
        r#"{"matching_video_url":"https://h/c/v.mp4","matching_video_name":"v.mp4","video_hash_id":"h1","language_codes":"en","video_id":"vid-1"}"#
    );
}

#[test]
fn workflow_message_rejects_non_objects() {
    assert!(matches!(
        WorkflowMessage::from_value(json!(["not", "an", "object"])),
        Err(ExtractError::InvalidMessage(_))
    ));
    assert!(WorkflowMessage::from_json("not json").is_err());
}

#[test]
fn insights_destination_derives_from_display_name() {
    let options = sample_options();
    assert_eq!(
        options.insights_destination("clip.v2.mp4").unwrap().as_str(),
        "https://datastore.example.net/silver/clip/vi_insights.json"
    );
    assert_eq!(
        options.insights_destination("noext").unwrap().as_str(),
        "https://datastore.example.net/silver/noext/vi_insights.json"
    );
}

#[test]
fn extraction_options_load_from_env() {
    std::env::set_var("DATA_STORAGE_URI", "https://datastore.example.net/");
    std::env::set_var("BRONZE_CONTAINER_NAME", "bronze");
    std::env::set_var("SILVER_CONTAINER_NAME", "silver");
    let options = ExtractionOptions::from_env().unwrap();
    assert_eq!(options.data_storage_uri.as_str(), "https://datastore.example.net/");
    assert_eq!(options.bronze_container, "bronze");
    assert_eq!(options.silver_container, "silver");
    std::env::remove_var("DATA_STORAGE_URI");
    assert!(matches!(
        ExtractionOptions::from_env(),
        Err(ExtractError::Config(_))
    ));
    std::env::remove_var("BRONZE_CONTAINER_NAME");
    std::env::remove_var("SILVER_CONTAINER_NAME");
}

// The JSONL-backed queue feeds its own consumer end in FIFO order.
#[tokio::test]
async fn fs_message_queue_round_trips_jsonl() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = FsMessageQueue::new(tmp.path().join("dataproc-queue.jsonl"));
    queue.enqueue(&json!({"a": 1})).await.unwrap();
    queue.enqueue(&json!({"b": 2})).await.unwrap();
    assert_eq!(queue.next_message().await.unwrap(), Some(json!({"a": 1})));
    assert_eq!(queue.next_message().await.unwrap(), Some(json!({"b": 2})));
    assert_eq!(queue.next_message().await.unwrap(), None);
}

#[tokio::test]
async fn fs_blob_store_maps_urls_under_root() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FsBlobStore::new(tmp.path());
    let url = Url::parse("https://datastore.example.net/bronze/clip.mp4").unwrap();

    assert!(!store.exists(&url).await.unwrap());
    store.upload(&url, b"bytes").await.unwrap();
    assert!(store.exists(&url).await.unwrap());
    assert!(tmp
        .path()
        .join("datastore.example.net/bronze/clip.mp4")
        .is_file());

    let signed = store
        .sign_read_url(&url, Duration::from_secs(3600))
        .await
        .unwrap();
    let query = signed.query().unwrap_or_default();
    assert!(query.contains("se=") && query.contains("sig="), "got {query}");

    // signing an absent blob fails
    let missing = Url::parse("https://datastore.example.net/bronze/none.mp4").unwrap();
    assert!(store
        .sign_read_url(&missing, Duration::from_secs(3600))
        .await
        .is_err());
}
