// rejourney — session replay for mobile apps
// https://rejourney.co

//! Session lifecycle state machine.
//!
//! The controller owns the whole pipeline one-way: scheduler and redactor
//! on the UI side, the frame encoder (which owns the segment store), and
//! the serialized upload queue. Cross-cutting signals come back over
//! channels and are drained on every tick — nothing here blocks the UI
//! thread except the explicitly async stop paths.
//!
//! Phases: `Idle → Starting → Active → Draining → Terminated`. A long
//! enough background stay restarts the session in place (new id, fresh
//! admission roll) instead of draining.

use crate::promotion::{promotion_score, should_promote, SessionMetrics};
use rejourney_capture::scheduler::DEFENSIVE_DELAY;
use rejourney_capture::{
    AdaptiveSampler, CaptureScheduler, Decision, Frame, Redactor, SchedulerConfig, UiActivity,
};
use rejourney_core::time::now_epoch_ms;
use rejourney_core::{
    roll_admission, ConfigSnapshot, CoreTelemetry, EventData, GestureKind, NavigationSource, Rect,
    SessionEvent, SessionId, UploadError,
};
use rejourney_storage::{
    self as storage, DurableKv, EncoderConfig, EventBuffer, FrameEncoder, Segment, SegmentStore,
    SessionMeta, CURRENT_SESSION_KEY,
};
use rejourney_upload::{
    BackgroundTaskGuard, BackgroundTaskHost, RetryPolicy, TokenProvider, UploadClient, UploadJob,
    UploadOutcome, UploadQueue,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Cumulative background time after which a foreground transition restarts
/// the session.
pub const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60);

/// Global bound on final flushes during drain, restart, and shutdown.
pub const FINAL_FLUSH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Draining,
    Terminated,
}

/// Facade notifications surfaced to the embedding app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkNotification {
    /// Device auth failed permanently; the session runs in degraded mode.
    AuthFailed,
    /// Remote config disabled the SDK; the session was drained.
    DisabledByRemote,
    /// The session hit its maximum duration and was force-ended.
    MaxDurationReached,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub api_url: String,
    pub data_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    pub encoder: EncoderConfig,
    pub retry: RetryPolicy,
    pub background_timeout: Duration,
}

impl ControllerConfig {
    pub fn new(api_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.into(),
            data_dir: data_dir.into(),
            scheduler: SchedulerConfig::default(),
            encoder: EncoderConfig::default(),
            retry: RetryPolicy::default(),
            background_timeout: BACKGROUND_TIMEOUT,
        }
    }

    /// Standard data directory: `~/.rejourney` (current directory when the
    /// home lookup fails).
    pub fn with_default_data_dir(api_url: impl Into<String>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(api_url, home.join(".rejourney"))
    }
}

/// Per-session mutable state, owned exclusively by the controller.
struct ActiveSession {
    id: SessionId,
    started: Instant,
    started_wall_ms: u64,
    user_tag: Option<String>,
    config: ConfigSnapshot,
    sample_admission: bool,
    video_enabled: bool,
    background_ms: u64,
    background_entered_at: Option<Instant>,
    metrics: SessionMetrics,
    screens: HashSet<String>,
    api_latency_total_ms: f64,
}

impl ActiveSession {
    fn finalize_metrics(&self, now: Instant) -> SessionMetrics {
        let mut metrics = self.metrics.clone();
        metrics.duration_seconds = now.duration_since(self.started).as_secs_f64();
        if let Some(total) = metrics.api_total_count {
            if total > 0 {
                metrics.avg_api_latency_ms = self.api_latency_total_ms / total as f64;
            }
        }
        if !self.screens.is_empty() {
            metrics.screen_count = Some(self.screens.len() as u32);
        }
        metrics
    }
}

pub struct SessionController {
    config: ControllerConfig,
    phase: SessionPhase,
    tokens: Arc<dyn TokenProvider>,
    background_host: Arc<dyn BackgroundTaskHost>,
    kv: Arc<dyn DurableKv>,
    telemetry: Arc<CoreTelemetry>,
    sampler: Arc<AdaptiveSampler>,
    redactor: Arc<Redactor>,
    scheduler: CaptureScheduler,
    events: EventBuffer,
    session: Option<ActiveSession>,
    /// Sidecar store for meta/events/crash files; segment commits live
    /// with the encoder worker.
    store: Option<SegmentStore>,
    encoder: Option<FrameEncoder>,
    sealed_rx: Option<mpsc::UnboundedReceiver<Segment>>,
    client: Option<Arc<UploadClient>>,
    uploader: Option<UploadQueue>,
    outcome_rx: Option<mpsc::UnboundedReceiver<UploadOutcome>>,
    config_rx: Option<oneshot::Receiver<Result<ConfigSnapshot, UploadError>>>,
    notify_tx: mpsc::UnboundedSender<SdkNotification>,
    background_guard: Option<BackgroundTaskGuard>,
    /// Auth-failure notification fires at most once per session.
    auth_notified: bool,
    /// Segments that exhausted their retries this session; while any
    /// exist, the session directory survives for the next boot.
    failed_segments: u32,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        tokens: Arc<dyn TokenProvider>,
        background_host: Arc<dyn BackgroundTaskHost>,
        kv: Arc<dyn DurableKv>,
    ) -> (Self, mpsc::UnboundedReceiver<SdkNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let scheduler = CaptureScheduler::new(config.scheduler.clone(), Instant::now());
        let controller = Self {
            config,
            phase: SessionPhase::Idle,
            tokens,
            background_host,
            kv,
            telemetry: CoreTelemetry::new(),
            sampler: AdaptiveSampler::new(),
            redactor: Arc::new(Redactor::new()),
            scheduler,
            events: EventBuffer::new(),
            session: None,
            store: None,
            encoder: None,
            sealed_rx: None,
            client: None,
            uploader: None,
            outcome_rx: None,
            config_rx: None,
            notify_tx,
            background_guard: None,
            auth_notified: false,
            failed_segments: 0,
        };
        (controller, notify_rx)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn video_enabled(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.video_enabled)
    }

    pub fn accumulated_background_ms(&self) -> u64 {
        self.session.as_ref().map(|s| s.background_ms).unwrap_or(0)
    }

    pub fn telemetry(&self) -> &Arc<CoreTelemetry> {
        &self.telemetry
    }

    pub fn sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.sampler
    }

    pub fn redactor(&self) -> &Arc<Redactor> {
        &self.redactor
    }

    /// Start a session. Returns synchronously with the new id; the config
    /// fetch continues in the background and may tighten video capture
    /// once resolved.
    pub async fn start(&mut self, user_tag: Option<String>, now: Instant) -> anyhow::Result<SessionId> {
        anyhow::ensure!(
            matches!(self.phase, SessionPhase::Idle | SessionPhase::Terminated),
            "a session is already running"
        );

        // Ship whatever previous boots left behind before the new session
        // starts writing.
        self.recover_previous_boots();

        let id = SessionId::generate();
        self.kv.set(CURRENT_SESSION_KEY, &id.to_string());
        self.events = EventBuffer::new();

        let defaults = ConfigSnapshot::default();
        self.session = Some(ActiveSession {
            id,
            started: now,
            started_wall_ms: now_epoch_ms(),
            user_tag,
            config: defaults,
            // Optimistic until the config resolves; a 0% sample rate then
            // flips video off before any segment uploads.
            sample_admission: true,
            video_enabled: defaults.recording_allowed(),
            background_ms: 0,
            background_entered_at: None,
            metrics: SessionMetrics::default(),
            screens: HashSet::new(),
            api_latency_total_ms: 0.0,
        });

        self.open_pipeline(id, now)?;
        self.write_meta(None);
        self.push_event(EventData::SessionStart {
            previous_session_id: None,
            background_duration: None,
            reason: None,
        });
        self.spawn_config_fetch();
        self.phase = SessionPhase::Starting;
        info!("session started: {}", id);
        Ok(id)
    }

    /// Build the per-session pipeline: stores, upload client + queue, and
    /// the encoder worker wired to the scheduler's backpressure flag.
    fn open_pipeline(&mut self, id: SessionId, now: Instant) -> anyhow::Result<()> {
        let sidecar_store = SegmentStore::open(&self.config.data_dir, id)?;
        let encoder_store = SegmentStore::open(&self.config.data_dir, id)?;
        let status_store = SegmentStore::open(&self.config.data_dir, id)?;

        let client = Arc::new(UploadClient::new(
            self.config.api_url.clone(),
            id,
            self.tokens.clone(),
            self.config.retry.clone(),
            self.telemetry.clone(),
        ));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let uploader = UploadQueue::spawn(client.clone(), status_store, outcome_tx);

        self.scheduler = CaptureScheduler::new(self.config.scheduler.clone(), now);
        let (encoder, sealed_rx) = FrameEncoder::spawn(
            encoder_store,
            self.config.encoder.clone(),
            self.sampler.clone(),
            self.telemetry.clone(),
            self.scheduler.backpressure_flag(),
        );

        self.store = Some(sidecar_store);
        self.encoder = Some(encoder);
        self.sealed_rx = Some(sealed_rx);
        self.client = Some(client);
        self.uploader = Some(uploader);
        self.outcome_rx = Some(outcome_rx);
        self.auth_notified = false;
        self.failed_segments = 0;
        Ok(())
    }

    fn spawn_config_fetch(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        self.config_rx = Some(rx);
        tokio::spawn(async move {
            let _ = tx.send(client.fetch_config().await);
        });
    }

    /// Ship segments, events, and crash reports persisted by previous
    /// boots, then delete the emptied directories. Runs detached; the new
    /// session does not wait on it.
    fn recover_previous_boots(&self) {
        let recovered = storage::list_recoverable(&self.config.data_dir);
        if recovered.is_empty() {
            return;
        }
        for session in recovered {
            let api_url = self.config.api_url.clone();
            let tokens = self.tokens.clone();
            let retry = self.config.retry.clone();
            let telemetry = self.telemetry.clone();
            let data_dir = self.config.data_dir.clone();
            tokio::spawn(async move {
                ship_recovered(api_url, tokens, retry, telemetry, data_dir, session).await;
            });
        }
    }

    // -- capture path -------------------------------------------------------

    /// Periodic driver, called from the host's UI tick (~1 Hz). Pumps the
    /// internal channels and returns the capture decision for this moment.
    pub async fn tick(&mut self, now: Instant) -> Decision {
        self.pump(now).await;

        if !matches!(self.phase, SessionPhase::Starting | SessionPhase::Active) {
            return Decision::Defer {
                reason: "inactive",
                earliest: now + self.config.scheduler.base_interval,
            };
        }

        let (max_elapsed, backgrounded, video) = match &self.session {
            Some(s) => (
                now.duration_since(s.started) >= Duration::from_secs(s.config.max_session_secs()),
                s.background_entered_at.is_some(),
                s.video_enabled,
            ),
            None => (false, false, false),
        };

        if max_elapsed && self.phase == SessionPhase::Active {
            self.notify(SdkNotification::MaxDurationReached);
            self.push_event(EventData::SessionEnd {
                reason: "max_duration_reached".into(),
            });
            self.finish_session("max_duration_reached", now).await;
            return Decision::Defer {
                reason: "max_duration_reached",
                earliest: now + self.config.scheduler.base_interval,
            };
        }

        if backgrounded {
            return Decision::Defer {
                reason: "backgrounded",
                earliest: now + self.config.scheduler.base_interval,
            };
        }

        if !video {
            return Decision::Defer {
                reason: "video_disabled",
                earliest: now + self.config.scheduler.base_interval,
            };
        }

        self.scheduler.set_cadence_factor(self.sampler.factor());
        self.scheduler.tick(now)
    }

    /// Accept a captured frame: redact in place, hand to the encoder, and
    /// reset the capture heartbeat.
    pub fn submit_frame(&mut self, mut frame: Frame, now: Instant) {
        let capturing = matches!(self.phase, SessionPhase::Starting | SessionPhase::Active)
            && self.session.as_ref().is_some_and(|s| s.video_enabled);
        if !capturing {
            debug!("frame submitted outside capture window, dropping");
            return;
        }

        self.redactor.apply(&mut frame.image, &frame.regions, frame.scale);
        CoreTelemetry::incr(&self.telemetry.frames_captured);
        if let Some(encoder) = &self.encoder {
            encoder.append(frame);
        }
        self.scheduler.mark_captured(now);
    }

    /// A capture attempt produced no frame (no key window, etc.).
    pub fn capture_failed(&mut self, reason: &str) {
        self.scheduler.capture_failed(reason);
    }

    // -- observation inputs -------------------------------------------------

    fn observing(&self) -> bool {
        matches!(self.phase, SessionPhase::Starting | SessionPhase::Active)
    }

    fn push_event(&mut self, data: EventData) {
        self.events.append(SessionEvent::new(now_epoch_ms(), data));
    }

    /// Raw UI activity feed for the scheduler's blocker windows.
    pub fn note_ui_activity(&mut self, activity: UiActivity, now: Instant) {
        if !self.observing() {
            return;
        }
        if activity == UiActivity::ScrollEnd {
            if let Some(s) = &mut self.session {
                s.metrics.scroll_count = Some(s.metrics.scroll_count.unwrap_or(0) + 1);
            }
        }
        self.scheduler.note_activity(activity, now);
    }

    /// Scroll offset report; bounce detection feeds the scroll blocker.
    pub fn note_scroll_offset(
        &mut self,
        offset_y: f32,
        top_inset: f32,
        bottom_inset: f32,
        content_height: f32,
        visible_height: f32,
        now: Instant,
    ) {
        if self.observing() {
            self.scheduler.note_scroll_offset(
                offset_y,
                top_inset,
                bottom_inset,
                content_height,
                visible_height,
                now,
            );
        }
    }

    pub fn on_gesture(&mut self, kind: GestureKind, target_label: Option<String>, now: Instant) {
        if !self.observing() {
            return;
        }
        if let Some(s) = &mut self.session {
            s.metrics.touch_count = Some(s.metrics.touch_count.unwrap_or(0) + 1);
            match kind {
                GestureKind::RageTap => s.metrics.rage_tap_count += 1,
                GestureKind::DeadTap => s.metrics.dead_tap_count += 1,
                _ => {}
            }
        }
        self.scheduler.note_activity(UiActivity::TouchEnd, now);
        self.scheduler
            .request_defensive(DEFENSIVE_DELAY, "gesture_end", now);
        self.push_event(EventData::Gesture { kind, target_label });
    }

    pub fn on_motion(&mut self, kind: impl Into<String>) {
        if self.observing() {
            self.push_event(EventData::Motion { kind: kind.into() });
        }
    }

    pub fn on_navigation(&mut self, screen_name: &str, source: NavigationSource, now: Instant) {
        if !self.observing() {
            return;
        }
        if let Some(s) = &mut self.session {
            s.screens.insert(screen_name.to_string());
        }
        self.scheduler.note_activity(UiActivity::Navigation, now);
        self.scheduler
            .request_defensive(DEFENSIVE_DELAY, "navigation", now);
        self.push_event(EventData::Navigation {
            screen_name: screen_name.to_string(),
            source,
        });
    }

    pub fn on_keyboard_show(&mut self, frame: Rect, now: Instant) {
        if !self.observing() {
            return;
        }
        self.scheduler
            .note_activity(UiActivity::KeyboardAnimationStart, now);
        self.push_event(EventData::KeyboardShow { frame });
    }

    pub fn on_keyboard_hide(&mut self, key_press_count: u32, now: Instant) {
        if !self.observing() {
            return;
        }
        self.scheduler
            .note_activity(UiActivity::KeyboardAnimationEnd, now);
        self.scheduler
            .request_defensive(DEFENSIVE_DELAY, "keyboard_hide", now);
        self.push_event(EventData::KeyboardHide { key_press_count });
    }

    /// One keystroke; consecutive presses coalesce in the buffer.
    pub fn on_keyboard_typing(&mut self) {
        if self.observing() {
            self.push_event(EventData::KeyboardTyping { key_press_count: 1 });
        }
    }

    pub fn on_visual_change(&mut self) {
        if self.observing() {
            self.push_event(EventData::VisualChange);
        }
    }

    pub fn on_external_url(&mut self, scheme: impl Into<String>) {
        if self.observing() {
            self.push_event(EventData::ExternalUrl {
                scheme: scheme.into(),
            });
        }
    }

    pub fn on_oauth_started(&mut self, provider: impl Into<String>) {
        if self.observing() {
            self.push_event(EventData::OauthStarted {
                provider: provider.into(),
            });
        }
    }

    pub fn on_oauth_completed(&mut self, provider: impl Into<String>, success: bool) {
        if self.observing() {
            self.push_event(EventData::OauthCompleted {
                provider: provider.into(),
                success,
            });
        }
    }

    pub fn on_oauth_returned(&mut self, provider: impl Into<String>) {
        if self.observing() {
            self.push_event(EventData::OauthReturned {
                provider: provider.into(),
            });
        }
    }

    pub fn on_user_identity_changed(&mut self, user_tag: impl Into<String>) {
        if !self.observing() {
            return;
        }
        let user_tag = user_tag.into();
        if let Some(s) = &mut self.session {
            s.user_tag = Some(user_tag.clone());
        }
        self.write_meta(None);
        self.push_event(EventData::UserIdentityChanged { user_tag });
    }

    pub fn on_app_startup(&mut self, duration_ms: u64) {
        if !self.observing() {
            return;
        }
        if let Some(s) = &mut self.session {
            s.metrics.startup_time_ms = duration_ms as f64;
        }
        self.push_event(EventData::AppStartup { duration_ms });
    }

    /// API call observation feeding the promotion metrics.
    pub fn record_api_call(&mut self, latency_ms: f64, success: bool) {
        if let Some(s) = &mut self.session {
            s.api_latency_total_ms += latency_ms;
            s.metrics.api_total_count = Some(s.metrics.api_total_count.unwrap_or(0) + 1);
            if success {
                s.metrics.api_success_count = Some(s.metrics.api_success_count.unwrap_or(0) + 1);
            } else {
                s.metrics.api_error_count += 1;
            }
        }
    }

    pub fn record_error(&mut self) {
        if let Some(s) = &mut self.session {
            s.metrics.error_count += 1;
        }
    }

    pub fn record_custom_event(&mut self) {
        if let Some(s) = &mut self.session {
            s.metrics.custom_event_count = Some(s.metrics.custom_event_count.unwrap_or(0) + 1);
        }
    }

    pub fn on_anr(&mut self, duration_ms: u64, thread_state: Option<String>) {
        if !self.observing() {
            return;
        }
        if let Some(s) = &mut self.session {
            s.metrics.anr_count += 1;
        }
        self.push_event(EventData::Anr {
            duration_ms,
            thread_state: thread_state.clone(),
        });
        if let Some(uploader) = &self.uploader {
            let report = serde_json::json!({
                "durationMs": duration_ms,
                "threadState": thread_state,
                "timestamp": now_epoch_ms(),
            });
            uploader.enqueue(UploadJob::AnrReport(report));
        }
    }

    /// Crash observation: persisted synchronously so the next boot can
    /// attach and ship it; the report itself goes out fire-and-forget.
    pub fn on_crash(&mut self, reason: impl Into<String>, report: serde_json::Value) {
        let reason = reason.into();
        if let Some(s) = &mut self.session {
            s.metrics.crash_count += 1;
        }
        self.push_event(EventData::Crash {
            reason: reason.clone(),
        });
        if let Some(store) = &self.store {
            if let Err(e) = store.write_crash_report(&report) {
                warn!("could not persist crash report: {}", e);
            }
        }
    }

    // -- lifecycle transitions ----------------------------------------------

    /// Background entry: pause capture, snapshot state to disk, and run a
    /// non-final flush under a background task escrow.
    pub async fn on_app_background(&mut self, now: Instant) {
        if !self.observing() {
            return;
        }
        let Some(session) = &mut self.session else {
            return;
        };
        if session.background_entered_at.is_some() {
            return;
        }
        session.background_entered_at = Some(now);

        self.push_event(EventData::AppBackground);
        self.redactor.set_app_in_background(true);
        self.background_guard = Some(BackgroundTaskGuard::begin(
            self.background_host.clone(),
            "background_flush",
        ));

        if let Some(encoder) = &self.encoder {
            encoder.pause();
            // Seal the open segment so the data is durable if the process
            // never comes back.
            encoder.flush_now().await;
        }

        self.write_meta(None);
        self.persist_events();
        self.pump_sealed();
        if let Some(uploader) = &self.uploader {
            uploader.enqueue(UploadJob::Events {
                events: self.events.snapshot(),
                is_final: false,
            });
        }
        debug!("background entry: state persisted, non-final flush queued");
    }

    /// Foreground return. A short stay resumes capture in place; a stay at
    /// or beyond the background timeout restarts the session and returns
    /// the new id.
    pub async fn on_app_foreground(&mut self, now: Instant) -> Option<SessionId> {
        let cumulative_ms = {
            let session = self.session.as_mut()?;
            let entered = session.background_entered_at.take()?;
            let interval_ms = now.duration_since(entered).as_millis() as u64;
            session.background_ms += interval_ms;
            debug!(
                "foreground after {}ms background (cumulative {}ms)",
                interval_ms, session.background_ms
            );
            session.background_ms
        };

        self.redactor.set_app_in_background(false);
        self.background_guard.take();

        if Duration::from_millis(cumulative_ms) >= self.config.background_timeout {
            let new_id = self.restart_after_timeout(now).await;
            return Some(new_id);
        }

        self.push_event(EventData::AppForeground);
        if self.video_enabled() {
            if let Some(encoder) = &self.encoder {
                encoder.resume();
            }
        }
        self.scheduler.mark_captured(now);
        self.write_meta(None);
        None
    }

    /// The session-timeout protocol: seal and flush the old session, then
    /// start a replacement with a fresh id and a fresh admission roll.
    async fn restart_after_timeout(&mut self, now: Instant) -> SessionId {
        let old = match self.session.take() {
            Some(s) => s,
            None => {
                // Unreachable from on_app_foreground; keep the state machine safe.
                self.telemetry.invariant_violation("restart without session");
                return SessionId::generate();
            }
        };
        info!(
            "session {} timed out after {}ms in background, restarting",
            old.id, old.background_ms
        );

        // 1. Sync accumulated background time into the session metadata.
        self.write_meta_for(&old, None);

        // 2. Seal the encoder and run the bounded synchronous final flush.
        self.push_event(EventData::SessionEnd {
            reason: "background_timeout".into(),
        });
        self.close_pipeline(&old, now).await;

        // Whatever the flush could not ship stays for the next boot; a
        // clean flush leaves nothing worth keeping.
        if !self.events.is_empty() {
            if let Some(store) = &self.store {
                let _ = store.persist_events(&self.events.snapshot());
            }
        } else if self.failed_segments == 0 {
            if let Err(e) = storage::purge_session(&self.config.data_dir, old.id) {
                debug!("could not purge session dir: {}", e);
            }
        }

        // 3-4. New identity, fresh buffers, fresh admission from the cached
        // config; the refetch proceeds asynchronously.
        let new_id = SessionId::generate();
        self.kv.set(CURRENT_SESSION_KEY, &new_id.to_string());
        self.events = EventBuffer::new();

        let cached = old.config;
        let admission = roll_admission(cached.sample_rate_percent);
        self.session = Some(ActiveSession {
            id: new_id,
            started: now,
            started_wall_ms: now_epoch_ms(),
            user_tag: old.user_tag.clone(),
            config: cached,
            sample_admission: admission,
            video_enabled: cached.recording_allowed() && admission,
            background_ms: 0,
            background_entered_at: None,
            metrics: SessionMetrics::default(),
            screens: HashSet::new(),
            api_latency_total_ms: 0.0,
        });

        // 5. Restart the pipeline and scheduler.
        if let Err(e) = self.open_pipeline(new_id, now) {
            warn!("pipeline restart failed: {}", e);
        }
        self.write_meta(Some(old.id.to_string()));
        self.spawn_config_fetch();
        self.phase = SessionPhase::Active;

        // 6. Announce the replacement session.
        self.push_event(EventData::SessionStart {
            previous_session_id: Some(old.id.to_string()),
            background_duration: Some(old.background_ms / 1000),
            reason: Some("background_timeout".into()),
        });
        info!("session restarted: {} -> {}", old.id, new_id);
        new_id
    }

    /// Explicit stop: drain, score, flush, terminate.
    pub async fn stop(&mut self, now: Instant) {
        if !self.observing() {
            return;
        }
        self.push_event(EventData::SessionEnd {
            reason: "stop".into(),
        });
        self.finish_session("stop", now).await;
    }

    /// Drain path shared by stop, max-duration, and remote disable. The
    /// `SessionEnd` event is appended by the caller with its own reason.
    async fn finish_session(&mut self, reason: &str, now: Instant) {
        let Some(old) = self.session.take() else {
            return;
        };
        info!("session {} draining ({})", old.id, reason);
        self.phase = SessionPhase::Draining;
        self.scheduler.cancel_defensive();

        // Promotion decision before the pipeline goes away.
        let metrics = old.finalize_metrics(now);
        let score = promotion_score(&metrics);
        if should_promote(&metrics) {
            if let Some(client) = &self.client {
                let path = format!("sessions/{}/promote", old.id);
                let body = serde_json::to_value(&metrics).unwrap_or_default();
                match client.post_json(&path, &body).await {
                    Ok(reply) => info!(
                        "session {} promoted (score {:.2}): {}",
                        old.id, score, reply
                    ),
                    Err(e) => warn!("promotion submit failed: {}", e),
                }
            }
        } else {
            debug!("session {} not promoted (score {:.2})", old.id, score);
        }

        self.close_pipeline(&old, now).await;

        if self.events.is_empty() && self.failed_segments == 0 {
            if let Err(e) = storage::purge_session(&self.config.data_dir, old.id) {
                debug!("could not purge session dir: {}", e);
            }
            self.kv.remove(CURRENT_SESSION_KEY);
        } else {
            // Whatever the flush could not ship stays for the next boot.
            if let Some(store) = &self.store {
                let _ = store.persist_events(&self.events.snapshot());
            }
        }

        self.telemetry.log_summary();
        self.store = None;
        self.client = None;
        self.sealed_rx = None;
        self.outcome_rx = None;
        self.config_rx = None;
        self.phase = SessionPhase::Terminated;
        info!("session {} terminated", old.id);
    }

    /// Seal the encoder, push remaining segments into the uploader, run the
    /// final events flush, and drain the queue under the global deadline.
    async fn close_pipeline(&mut self, old: &ActiveSession, _now: Instant) {
        if let Some(encoder) = self.encoder.take() {
            encoder.stop().await;
        }
        self.pump_sealed();

        if let Some(uploader) = self.uploader.take() {
            uploader.enqueue(UploadJob::Events {
                events: self.events.snapshot(),
                is_final: true,
            });
            uploader.drain(FINAL_FLUSH_DEADLINE).await;
        }
        self.pump_outcomes();

        if !self.events.is_empty() {
            debug!(
                "final flush for {} left {} events for next boot",
                old.id,
                self.events.len()
            );
        }
    }

    /// Pre-termination path: must stay synchronous and must not touch the
    /// network. The `AppTerminated` event lands on disk before the encoder
    /// writes its trailer.
    pub fn emergency_stop(&mut self) {
        self.events
            .append(SessionEvent::new(now_epoch_ms(), EventData::AppTerminated));
        self.persist_events();
        if let Some(encoder) = &self.encoder {
            encoder.emergency_flush_sync();
        }
        self.phase = SessionPhase::Terminated;
        info!("emergency stop complete");
    }

    // -- channel pumps ------------------------------------------------------

    async fn pump(&mut self, now: Instant) {
        // Config resolution.
        if let Some(rx) = &mut self.config_rx {
            match rx.try_recv() {
                Ok(result) => {
                    self.config_rx = None;
                    match result {
                        Ok(snapshot) => self.apply_config(snapshot, now).await,
                        Err(e) => {
                            warn!("config fetch failed, keeping defaults: {}", e);
                            if self.phase == SessionPhase::Starting {
                                self.phase = SessionPhase::Active;
                            }
                        }
                    }
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.config_rx = None;
                    if self.phase == SessionPhase::Starting {
                        self.phase = SessionPhase::Active;
                    }
                }
            }
        }

        self.pump_sealed();
        self.pump_outcomes();
    }

    async fn apply_config(&mut self, snapshot: ConfigSnapshot, now: Instant) {
        let sdk_disabled = {
            let Some(session) = &mut self.session else {
                return;
            };
            session.config = snapshot;
            session.sample_admission = roll_admission(snapshot.sample_rate_percent);
            session.video_enabled = snapshot.recording_allowed() && session.sample_admission;
            info!(
                "config resolved: sdk={}, recording={}, sample={}%, admission={}, video={}",
                snapshot.sdk_enabled,
                snapshot.recording_enabled,
                snapshot.sample_rate_percent,
                session.sample_admission,
                session.video_enabled
            );
            if !session.video_enabled {
                // Data-only mode: events keep flowing, no segments.
                if let Some(encoder) = &self.encoder {
                    encoder.pause();
                }
            }
            !snapshot.sdk_enabled
        };

        if self.phase == SessionPhase::Starting {
            self.phase = SessionPhase::Active;
        }

        if sdk_disabled {
            self.notify(SdkNotification::DisabledByRemote);
            self.push_event(EventData::SessionEnd {
                reason: "sdk_disabled".into(),
            });
            self.finish_session("sdk_disabled", now).await;
        }
    }

    fn pump_sealed(&mut self) {
        if let (Some(rx), Some(uploader)) = (&mut self.sealed_rx, &self.uploader) {
            while let Ok(segment) = rx.try_recv() {
                debug!("queueing sealed segment {} for upload", segment.seq);
                uploader.enqueue(UploadJob::Segment(segment));
            }
        }
    }

    fn pump_outcomes(&mut self) {
        let Some(rx) = &mut self.outcome_rx else {
            return;
        };
        let mut auth_failed = false;
        while let Ok(outcome) = rx.try_recv() {
            match outcome {
                UploadOutcome::EventsAccepted { accepted_count, .. } => {
                    self.events.drop_prefix(accepted_count);
                }
                UploadOutcome::SegmentUploaded { seq } => {
                    debug!("segment {} confirmed uploaded", seq);
                }
                UploadOutcome::SegmentFailed { seq, attempts } => {
                    self.failed_segments += 1;
                    warn!("segment {} failed after {} attempts", seq, attempts);
                }
                UploadOutcome::AuthFailed => auth_failed = true,
            }
        }
        if auth_failed && !self.auth_notified {
            self.auth_notified = true;
            let _ = self.notify_tx.send(SdkNotification::AuthFailed);
        }
    }

    fn notify(&self, notification: SdkNotification) {
        let _ = self.notify_tx.send(notification);
    }

    fn persist_events(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.persist_events(&self.events.snapshot()) {
                warn!("could not persist event buffer: {}", e);
            }
        }
    }

    fn write_meta(&mut self, previous_session_id: Option<String>) {
        if let Some(session) = self.session.take() {
            self.write_meta_for(&session, previous_session_id);
            self.session = Some(session);
        }
    }

    fn write_meta_for(&self, session: &ActiveSession, previous_session_id: Option<String>) {
        if let Some(store) = &self.store {
            let meta = SessionMeta {
                session_id: session.id,
                user_tag: session.user_tag.clone(),
                started_at_ms: session.started_wall_ms,
                background_ms: session.background_ms,
                previous_session_id,
            };
            if let Err(e) = store.write_meta(&meta) {
                warn!("could not write session meta: {}", e);
            }
        }
    }
}

/// Ship one recovered session's material, then clean its directory.
async fn ship_recovered(
    api_url: String,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    telemetry: Arc<CoreTelemetry>,
    data_dir: PathBuf,
    recovered: storage::RecoveredSession,
) {
    info!(
        "recovering session {}: {} segments, {} events, crash={}",
        recovered.session_id,
        recovered.segments.len(),
        recovered.events.len(),
        recovered.crash_report.is_some()
    );
    let client = UploadClient::new(
        api_url,
        recovered.session_id,
        tokens,
        retry,
        telemetry.clone(),
    );
    let mut status_store = match SegmentStore::open(&data_dir, recovered.session_id) {
        Ok(store) => store,
        Err(e) => {
            warn!("recovery store open failed: {}", e);
            return;
        }
    };

    let mut clean = true;
    for segment in &recovered.segments {
        match client.upload_segment(segment).await {
            Ok(()) => {
                CoreTelemetry::incr(&telemetry.segments_recovered);
                let _ = status_store.mark_uploaded(segment.seq);
            }
            Err(e) => {
                warn!("recovered segment {} upload failed: {}", segment.seq, e);
                let _ = status_store.mark_failed(segment.seq, segment.attempts + 1);
                clean = false;
                break;
            }
        }
    }

    if clean && !recovered.events.is_empty() {
        if let Err(e) = client.upload_events(&recovered.events, true).await {
            warn!("recovered events upload failed: {}", e);
            clean = false;
        }
    }

    if let Some(report) = &recovered.crash_report {
        // At most one attempt per boot, shipped or not.
        let _ = client.upload_crash_report(report).await;
        storage::remove_crash_report(&recovered.dir);
    }

    if clean {
        if let Err(e) = storage::purge_session(&data_dir, recovered.session_id) {
            debug!("could not purge recovered session dir: {}", e);
        }
        info!("session {} fully recovered", recovered.session_id);
    }
}
