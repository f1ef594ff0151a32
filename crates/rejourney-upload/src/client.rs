// rejourney — session replay for mobile apps
// https://rejourney.co

//! Token-authenticated HTTP client for the replay ingestion API.
//!
//! All calls run on the uploader queue; the UI thread never blocks on
//! them. Transient failures (network, 5xx) retry with exponential backoff;
//! a 401 triggers exactly one token refresh; 403/404 latch the client into
//! degraded mode until a new session builds a new client.

use crate::auth::TokenProvider;
use rejourney_core::{ConfigSnapshot, RemoteConfig, SessionEvent, SessionId, UploadError};
use rejourney_core::CoreTelemetry;
use rejourney_storage::Segment;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff parameters for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.saturating_sub(1));
        self.base
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

/// Server acknowledgement of an events batch.
#[derive(Debug, Clone, Copy)]
pub struct EventsAccepted {
    pub accepted_count: usize,
}

pub struct UploadClient {
    http: reqwest::Client,
    api_url: String,
    session_id: SessionId,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    telemetry: Arc<CoreTelemetry>,
    auth_failed: AtomicBool,
    auth_failed_status: AtomicU32,
}

impl UploadClient {
    pub fn new(
        api_url: impl Into<String>,
        session_id: SessionId,
        tokens: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
        telemetry: Arc<CoreTelemetry>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            session_id,
            tokens,
            retry,
            telemetry,
            auth_failed: AtomicBool::new(false),
            auth_failed_status: AtomicU32::new(0),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Degraded mode: auth failed permanently this session. Everything is
    /// buffered locally; no further network attempts are made.
    pub fn auth_permanently_failed(&self) -> bool {
        self.auth_failed.load(Ordering::Relaxed)
    }

    fn note_error(&self, error: &UploadError) {
        if let UploadError::AuthPermanent(status) = error {
            self.auth_failed.store(true, Ordering::Relaxed);
            self.auth_failed_status
                .store(*status as u32, Ordering::Relaxed);
        }
    }

    async fn bearer(&self) -> Result<String, UploadError> {
        if self.auth_permanently_failed() {
            return Err(UploadError::AuthPermanent(
                self.auth_failed_status.load(Ordering::Relaxed) as u16,
            ));
        }
        match self.tokens.token().await {
            Ok(token) => Ok(token.value),
            Err(e) => {
                self.note_error(&e);
                Err(e)
            }
        }
    }

    /// Run one request attempt with auth, refresh-once on 401, and
    /// transient backoff up to the retry cap.
    async fn retrying<T, F, Fut>(&self, what: &str, mut attempt_fn: F) -> Result<T, UploadError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let mut transient_attempts = 0u32;
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            match attempt_fn(token).await {
                Ok(value) => return Ok(value),
                Err(UploadError::AuthExpired) if !refreshed => {
                    debug!("{}: token expired, refreshing once", what);
                    refreshed = true;
                    match self.tokens.refresh().await {
                        Ok(_) => continue,
                        Err(e) => {
                            self.note_error(&e);
                            return Err(e);
                        }
                    }
                }
                Err(UploadError::Transient(msg))
                    if transient_attempts < self.retry.max_retries =>
                {
                    transient_attempts += 1;
                    CoreTelemetry::incr(&self.telemetry.upload_retries);
                    let delay = self.retry.delay(transient_attempts);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what, msg, transient_attempts, self.retry.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.note_error(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn check(
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, UploadError> {
        let resp = result.map_err(|e| UploadError::Transient(e.to_string()))?;
        match UploadError::from_status(resp.status().as_u16()) {
            None => Ok(resp),
            Some(e) => Err(e),
        }
    }

    /// POST the events batch. The caller drops the accepted prefix from its
    /// buffer only after this returns.
    pub async fn upload_events(
        &self,
        events: &[SessionEvent],
        is_final: bool,
    ) -> Result<EventsAccepted, UploadError> {
        let url = format!("{}/events/{}", self.api_url, self.session_id);
        let body = serde_json::json!({ "final": is_final, "events": events });
        let sent = events.len();

        let value: serde_json::Value = self
            .retrying("events upload", |token| {
                let req = self.http.post(&url).bearer_auth(token).json(&body);
                async move {
                    let resp = Self::check(req.send().await).await?;
                    resp.json()
                        .await
                        .map_err(|e| UploadError::Transient(e.to_string()))
                }
            })
            .await?;

        let accepted_count = value
            .get("acceptedCount")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(sent);
        CoreTelemetry::incr(&self.telemetry.uploads_ok);
        Ok(EventsAccepted { accepted_count })
    }

    /// POST a sealed segment as multipart. A 409 (already accepted) counts
    /// as success so crash-recovery re-uploads stay idempotent.
    pub async fn upload_segment(&self, segment: &Segment) -> Result<(), UploadError> {
        let payload = tokio::fs::read(&segment.path)
            .await
            .map_err(|e| UploadError::Transient(format!("segment read: {}", e)))?;
        let url = format!(
            "{}/segments/{}/{}",
            self.api_url, self.session_id, segment.seq
        );

        self.retrying("segment upload", |token| {
            let form = reqwest::multipart::Form::new()
                .text("startTs", segment.start_ts.to_string())
                .text("endTs", segment.end_ts.to_string())
                .text("frameCount", segment.frame_count.to_string())
                .part(
                    "payload",
                    reqwest::multipart::Part::bytes(payload.clone())
                        .file_name(format!("seg-{:08}.dat", segment.seq)),
                );
            let req = self.http.post(&url).bearer_auth(token).multipart(form);
            async move {
                Self::check(req.send().await).await?;
                Ok(())
            }
        })
        .await?;

        CoreTelemetry::incr(&self.telemetry.uploads_ok);
        debug!(
            "segment {} uploaded ({} frames)",
            segment.seq, segment.frame_count
        );
        Ok(())
    }

    /// Fire-and-forget crash report: at most one attempt per boot.
    pub async fn upload_crash_report(
        &self,
        report: &serde_json::Value,
    ) -> Result<(), UploadError> {
        self.post_once(&format!("crashes/{}", self.session_id), report)
            .await
    }

    /// Fire-and-forget ANR report: at most one attempt per boot.
    pub async fn upload_anr_report(&self, report: &serde_json::Value) -> Result<(), UploadError> {
        self.post_once(&format!("anrs/{}", self.session_id), report)
            .await
    }

    async fn post_once(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), UploadError> {
        let token = self.bearer().await?;
        let url = format!("{}/{}", self.api_url, path);
        let result = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await;
        let outcome = Self::check(result).await.map(|_| ());
        if let Err(e) = &outcome {
            self.note_error(e);
        }
        outcome
    }

    /// Fetch and resolve the remote config.
    pub async fn fetch_config(&self) -> Result<ConfigSnapshot, UploadError> {
        let url = format!("{}/config", self.api_url);
        let remote: RemoteConfig = self
            .retrying("config fetch", |token| {
                let req = self.http.get(&url).bearer_auth(token);
                async move {
                    let resp = Self::check(req.send().await).await?;
                    resp.json()
                        .await
                        .map_err(|e| UploadError::Transient(e.to_string()))
                }
            })
            .await?;
        Ok(remote.into())
    }

    /// POST an arbitrary JSON document under `{apiUrl}/{path}` with the
    /// full retry policy. Used for the session promotion decision.
    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UploadError> {
        let url = format!("{}/{}", self.api_url, path);
        self.retrying("json post", |token| {
            let req = self.http.post(&url).bearer_auth(token).json(body);
            async move {
                let resp = Self::check(req.send().await).await?;
                resp.json()
                    .await
                    .map_err(|e| UploadError::Transient(e.to_string()))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(32));
        // Capped at the max delay.
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let client = UploadClient::new(
            "https://api.rejourney.co/v1/",
            SessionId::generate(),
            Arc::new(crate::auth::StaticTokenProvider::new("t")),
            RetryPolicy::default(),
            CoreTelemetry::new(),
        );
        assert_eq!(client.api_url, "https://api.rejourney.co/v1");
    }
}
