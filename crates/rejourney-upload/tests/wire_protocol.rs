// rejourney — session replay for mobile apps
// https://rejourney.co

//! Wire-format tests against an in-process server speaking the ingestion
//! API: events JSON, segment multipart, config fetch, retry/backoff, token
//! refresh, and the permanent-auth degraded mode.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rejourney_core::{CoreTelemetry, EventData, SessionEvent, SessionId, UploadError};
use rejourney_upload::{
    AuthToken, RetryPolicy, StaticTokenProvider, TokenProvider, UploadClient, UploadJob,
    UploadOutcome, UploadQueue,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

#[derive(Clone, Default)]
struct AppState(Arc<Inner>);

#[derive(Default)]
struct Inner {
    /// (seq, payload length) per accepted segment POST.
    segments: Mutex<Vec<(u32, usize)>>,
    /// Raw bodies of accepted events POSTs.
    event_bodies: Mutex<Vec<serde_json::Value>>,
    /// Serve this many 500s before succeeding.
    fail_with_500: AtomicU32,
    /// Respond 409 for these segment seqs.
    conflict_seqs: Mutex<HashSet<u32>>,
    /// When set, any bearer other than this gets a 401.
    required_token: Mutex<Option<String>>,
    /// When set, every request gets this status.
    hard_status: AtomicU32,
    requests_seen: AtomicU32,
}

impl Inner {
    fn gate(&self, headers: &HeaderMap) -> Option<StatusCode> {
        self.requests_seen.fetch_add(1, Ordering::SeqCst);
        let hard = self.hard_status.load(Ordering::SeqCst);
        if hard != 0 {
            return StatusCode::from_u16(hard as u16).ok();
        }
        if self.fail_with_500.load(Ordering::SeqCst) > 0 {
            self.fail_with_500.fetch_sub(1, Ordering::SeqCst);
            return Some(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if let Some(required) = self.required_token.lock().unwrap().clone() {
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if bearer != format!("Bearer {}", required) {
                return Some(StatusCode::UNAUTHORIZED);
            }
        }
        None
    }
}

async fn events_handler(
    State(state): State<AppState>,
    Path(_session): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    if let Some(status) = state.0.gate(&headers) {
        return (status, Json(serde_json::json!({})));
    }
    let count = body["events"].as_array().map(|a| a.len()).unwrap_or(0);
    state.0.event_bodies.lock().unwrap().push(body);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "acceptedCount": count })),
    )
}

async fn segment_handler(
    State(state): State<AppState>,
    Path((_session, seq)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(status) = state.0.gate(&headers) {
        return status;
    }
    if state.0.conflict_seqs.lock().unwrap().contains(&seq) {
        return StatusCode::CONFLICT;
    }
    state.0.segments.lock().unwrap().push((seq, body.len()));
    StatusCode::OK
}

async fn config_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(status) = state.0.gate(&headers) {
        return (status, Json(serde_json::json!({})));
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "rejourneyEnabled": true,
            "recordingEnabled": false,
            "sampleRate": 40,
            "maxRecordingMinutes": 5
        })),
    )
}

async fn report_handler(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    state.0.gate(&headers).unwrap_or(StatusCode::OK)
}

async fn spawn_server(state: AppState) -> String {
    let router = Router::new()
        .route("/events/:session", post(events_handler))
        .route("/segments/:session/:seq", post(segment_handler))
        .route("/config", get(config_handler))
        .route("/crashes/:session", post(report_handler))
        .route("/anrs/:session", post(report_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(10),
        factor: 2,
        max_delay: Duration::from_millis(80),
        max_retries: 5,
    }
}

fn client_for(base: &str, session_id: SessionId, telemetry: Arc<CoreTelemetry>) -> UploadClient {
    UploadClient::new(
        base,
        session_id,
        Arc::new(StaticTokenProvider::new("test-token")),
        fast_retry(),
        telemetry,
    )
}

fn sample_events() -> Vec<SessionEvent> {
    vec![
        SessionEvent::new(
            1000,
            EventData::SessionStart {
                previous_session_id: None,
                background_duration: None,
                reason: None,
            },
        ),
        SessionEvent::new(2000, EventData::SessionEnd { reason: "stop".into() }),
    ]
}

#[tokio::test]
async fn test_events_upload_roundtrip() {
    let state = AppState::default();
    let base = spawn_server(state.clone()).await;
    let client = client_for(&base, SessionId::generate(), CoreTelemetry::new());

    let accepted = client.upload_events(&sample_events(), true).await.unwrap();
    assert_eq!(accepted.accepted_count, 2);

    let bodies = state.0.event_bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["final"], true);
    assert_eq!(bodies[0]["events"][0]["type"], "sessionStart");
    assert_eq!(bodies[0]["events"][1]["type"], "sessionEnd");
}

#[tokio::test]
async fn test_segment_upload_multipart() {
    let state = AppState::default();
    let base = spawn_server(state.clone()).await;
    let session_id = SessionId::generate();
    let client = client_for(&base, session_id, CoreTelemetry::new());

    let tmp = TempDir::new().unwrap();
    let mut store = rejourney_storage::SegmentStore::open(tmp.path(), session_id).unwrap();
    let mut handle = store.begin_segment(0, 1000).unwrap();
    handle.append_frame(1000, b"jpeg-bytes").unwrap();
    let segment = store.commit_segment(handle, 1000, 1).unwrap();

    client.upload_segment(&segment).await.unwrap();

    let segments = state.0.segments.lock().unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].0, 0);
    // Multipart body: fields plus the payload part.
    assert!(segments[0].1 > b"jpeg-bytes".len());
}

#[tokio::test]
async fn test_segment_conflict_is_success() {
    let state = AppState::default();
    state.0.conflict_seqs.lock().unwrap().insert(0);
    let base = spawn_server(state.clone()).await;
    let session_id = SessionId::generate();
    let client = client_for(&base, session_id, CoreTelemetry::new());

    let tmp = TempDir::new().unwrap();
    let mut store = rejourney_storage::SegmentStore::open(tmp.path(), session_id).unwrap();
    let handle = store.begin_segment(0, 1000).unwrap();
    let segment = store.commit_segment(handle, 1000, 0).unwrap();

    // Server already has (session, seq): treated as an accepted upload.
    client.upload_segment(&segment).await.unwrap();
    assert!(state.0.segments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_retried_with_backoff() {
    let state = AppState::default();
    state.0.fail_with_500.store(2, Ordering::SeqCst);
    let base = spawn_server(state.clone()).await;
    let telemetry = CoreTelemetry::new();
    let client = client_for(&base, SessionId::generate(), telemetry.clone());

    let accepted = client.upload_events(&sample_events(), false).await.unwrap();
    assert_eq!(accepted.accepted_count, 2);
    assert_eq!(CoreTelemetry::get(&telemetry.upload_retries), 2);
    assert_eq!(state.0.requests_seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_exhaust_into_failure() {
    let state = AppState::default();
    state.0.fail_with_500.store(100, Ordering::SeqCst);
    let base = spawn_server(state.clone()).await;
    let client = client_for(&base, SessionId::generate(), CoreTelemetry::new());

    let err = client.upload_events(&sample_events(), false).await.unwrap_err();
    assert!(err.is_transient());
    // 1 initial attempt + 5 retries.
    assert_eq!(state.0.requests_seen.load(Ordering::SeqCst), 6);
}

/// Provider whose refresh switches to the token the server accepts.
struct RefreshingProvider {
    inner: StaticTokenProvider,
    refreshes: AtomicU32,
}

#[async_trait]
impl TokenProvider for RefreshingProvider {
    async fn token(&self) -> Result<AuthToken, UploadError> {
        self.inner.token().await
    }

    async fn refresh(&self) -> Result<AuthToken, UploadError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.inner.set("fresh-token");
        self.inner.refresh().await
    }
}

#[tokio::test]
async fn test_expired_token_refreshed_exactly_once() {
    let state = AppState::default();
    *state.0.required_token.lock().unwrap() = Some("fresh-token".into());
    let base = spawn_server(state.clone()).await;

    let provider = Arc::new(RefreshingProvider {
        inner: StaticTokenProvider::new("stale-token"),
        refreshes: AtomicU32::new(0),
    });
    let client = UploadClient::new(
        &base,
        SessionId::generate(),
        provider.clone(),
        fast_retry(),
        CoreTelemetry::new(),
    );

    let accepted = client.upload_events(&sample_events(), false).await.unwrap();
    assert_eq!(accepted.accepted_count, 2);
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refresh_that_does_not_help_fails_without_looping() {
    let state = AppState::default();
    *state.0.required_token.lock().unwrap() = Some("unobtainable".into());
    let base = spawn_server(state.clone()).await;
    let client = client_for(&base, SessionId::generate(), CoreTelemetry::new());

    let err = client.upload_events(&sample_events(), false).await.unwrap_err();
    assert!(matches!(err, UploadError::AuthExpired));
    // Initial attempt + one post-refresh attempt, nothing more.
    assert_eq!(state.0.requests_seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_permanent_auth_failure_enters_degraded_mode() {
    let state = AppState::default();
    state.0.hard_status.store(403, Ordering::SeqCst);
    let base = spawn_server(state.clone()).await;
    let client = client_for(&base, SessionId::generate(), CoreTelemetry::new());

    let err = client.upload_events(&sample_events(), false).await.unwrap_err();
    assert!(matches!(err, UploadError::AuthPermanent(403)));
    assert!(client.auth_permanently_failed());
    let seen = state.0.requests_seen.load(Ordering::SeqCst);

    // Degraded: later calls short-circuit without touching the network.
    let err = client.upload_events(&sample_events(), false).await.unwrap_err();
    assert!(matches!(err, UploadError::AuthPermanent(403)));
    assert_eq!(state.0.requests_seen.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_fetch_config_resolves_snapshot() {
    let state = AppState::default();
    let base = spawn_server(state.clone()).await;
    let client = client_for(&base, SessionId::generate(), CoreTelemetry::new());

    let snapshot = client.fetch_config().await.unwrap();
    assert!(snapshot.sdk_enabled);
    assert!(!snapshot.recording_enabled);
    assert_eq!(snapshot.sample_rate_percent, 40);
    assert_eq!(snapshot.max_session_minutes, 5);
}

#[tokio::test]
async fn test_queue_uploads_in_order_and_records_status() {
    let state = AppState::default();
    let base = spawn_server(state.clone()).await;
    let session_id = SessionId::generate();
    let telemetry = CoreTelemetry::new();

    let tmp = TempDir::new().unwrap();
    let mut store = rejourney_storage::SegmentStore::open(tmp.path(), session_id).unwrap();
    let handle = store.begin_segment(0, 1000).unwrap();
    let seg0 = store.commit_segment(handle, 1100, 1).unwrap();
    let handle = store.begin_segment(1, 2000).unwrap();
    let seg1 = store.commit_segment(handle, 2100, 1).unwrap();

    let status_store = rejourney_storage::SegmentStore::open(tmp.path(), session_id).unwrap();
    let client = Arc::new(client_for(&base, session_id, telemetry));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let queue = UploadQueue::spawn(client, status_store, outcome_tx);

    queue.enqueue(UploadJob::Segment(seg0));
    queue.enqueue(UploadJob::Segment(seg1));
    queue.enqueue(UploadJob::Events {
        events: sample_events(),
        is_final: true,
    });
    queue.drain(Duration::from_secs(10)).await;

    assert_eq!(
        outcome_rx.recv().await,
        Some(UploadOutcome::SegmentUploaded { seq: 0 })
    );
    assert_eq!(
        outcome_rx.recv().await,
        Some(UploadOutcome::SegmentUploaded { seq: 1 })
    );
    assert_eq!(
        outcome_rx.recv().await,
        Some(UploadOutcome::EventsAccepted {
            accepted_count: 2,
            is_final: true
        })
    );

    let seqs: Vec<u32> = state.0.segments.lock().unwrap().iter().map(|s| s.0).collect();
    assert_eq!(seqs, vec![0, 1]);

    // mark_uploaded removed the files and recorded the status.
    let recovered = rejourney_storage::list_recoverable(tmp.path());
    assert!(recovered[0].segments.is_empty());
}

#[tokio::test]
async fn test_queue_reports_auth_failure_once_and_drops_jobs() {
    let state = AppState::default();
    state.0.hard_status.store(404, Ordering::SeqCst);
    let base = spawn_server(state.clone()).await;
    let session_id = SessionId::generate();

    let tmp = TempDir::new().unwrap();
    let status_store = rejourney_storage::SegmentStore::open(tmp.path(), session_id).unwrap();
    let client = Arc::new(client_for(&base, session_id, CoreTelemetry::new()));
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let queue = UploadQueue::spawn(client, status_store, outcome_tx);

    queue.enqueue(UploadJob::Events {
        events: sample_events(),
        is_final: false,
    });
    queue.enqueue(UploadJob::Events {
        events: sample_events(),
        is_final: false,
    });
    queue.enqueue(UploadJob::CrashReport(serde_json::json!({"reason": "test"})));
    queue.drain(Duration::from_secs(10)).await;

    let mut outcomes = Vec::new();
    while let Ok(outcome) = outcome_rx.try_recv() {
        outcomes.push(outcome);
    }
    let auth_failures = outcomes
        .iter()
        .filter(|o| **o == UploadOutcome::AuthFailed)
        .count();
    assert_eq!(auth_failures, 1);
    // Only the first request ever reached the server.
    assert_eq!(state.0.requests_seen.load(Ordering::SeqCst), 1);
}
