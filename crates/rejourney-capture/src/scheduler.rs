// rejourney — session replay for mobile apps
// https://rejourney.co

//! Heuristic capture gating.
//!
//! The scheduler produces "capture now" decisions timed to quiet UI
//! moments. Every named UI activity opens a blocker window; a capture is
//! allowed only once all blocker windows have lapsed. One-shot defensive
//! captures are scheduled shortly after transitions to snapshot the
//! post-transition state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Quiet intervals per activity kind. Tunable design constants.
pub const TOUCH_QUIET: Duration = Duration::from_millis(120);
pub const SCROLL_QUIET: Duration = Duration::from_millis(250);
pub const SCROLL_BOUNCE_QUIET: Duration = Duration::from_millis(400);
pub const KEYBOARD_QUIET: Duration = Duration::from_millis(300);
pub const NAVIGATION_QUIET: Duration = Duration::from_millis(150);
pub const MODAL_QUIET: Duration = Duration::from_millis(150);
pub const LARGE_ANIMATION_QUIET: Duration = Duration::from_millis(250);

/// Default delay for defensive captures after a transition.
pub const DEFENSIVE_DELAY: Duration = Duration::from_millis(180);

/// How long a backpressure signal defers captures before re-checking.
const BACKPRESSURE_RECHECK: Duration = Duration::from_millis(250);

/// Tolerance for scroll-bounce offset comparisons, in points.
const BOUNCE_EPSILON: f32 = 0.5;

/// UI activities reported by the observation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiActivity {
    TouchBegin,
    TouchEnd,
    ScrollBegin,
    ScrollEnd,
    ScrollBounce,
    KeyboardAnimationStart,
    KeyboardAnimationEnd,
    Navigation,
    ModalPresent,
    ModalDismiss,
    LargeAnimationBegin,
    LargeAnimationEnd,
}

/// One blocker per interaction family; begin/end pairs of the same family
/// refresh the same window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BlockerKind {
    Touch,
    Scroll,
    Keyboard,
    Navigation,
    Modal,
    Animation,
}

impl BlockerKind {
    fn reason(&self) -> &'static str {
        match self {
            BlockerKind::Touch => "touch",
            BlockerKind::Scroll => "scroll",
            BlockerKind::Keyboard => "keyboard",
            BlockerKind::Navigation => "navigation",
            BlockerKind::Modal => "modal",
            BlockerKind::Animation => "animation",
        }
    }
}

impl UiActivity {
    /// Which blocker family the activity refreshes, its quiet interval, and
    /// whether it opens (`Some(true)`) or closes (`Some(false)`) an ongoing
    /// span. Instantaneous activities return `None` for the span change.
    fn blocker(&self) -> (BlockerKind, Duration, Option<bool>) {
        match self {
            UiActivity::TouchBegin => (BlockerKind::Touch, TOUCH_QUIET, Some(true)),
            UiActivity::TouchEnd => (BlockerKind::Touch, TOUCH_QUIET, Some(false)),
            UiActivity::ScrollBegin => (BlockerKind::Scroll, SCROLL_QUIET, Some(true)),
            UiActivity::ScrollEnd => (BlockerKind::Scroll, SCROLL_QUIET, Some(false)),
            UiActivity::ScrollBounce => (BlockerKind::Scroll, SCROLL_BOUNCE_QUIET, None),
            UiActivity::KeyboardAnimationStart => {
                (BlockerKind::Keyboard, KEYBOARD_QUIET, Some(true))
            }
            UiActivity::KeyboardAnimationEnd => {
                (BlockerKind::Keyboard, KEYBOARD_QUIET, Some(false))
            }
            UiActivity::Navigation => (BlockerKind::Navigation, NAVIGATION_QUIET, None),
            UiActivity::ModalPresent => (BlockerKind::Modal, MODAL_QUIET, None),
            UiActivity::ModalDismiss => (BlockerKind::Modal, MODAL_QUIET, None),
            UiActivity::LargeAnimationBegin => {
                (BlockerKind::Animation, LARGE_ANIMATION_QUIET, Some(true))
            }
            UiActivity::LargeAnimationEnd => {
                (BlockerKind::Animation, LARGE_ANIMATION_QUIET, Some(false))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Blocker {
    last_event: Instant,
    quiet: Duration,
    /// True between a begin and its matching end — blocks regardless of
    /// how long ago the begin was observed.
    ongoing: bool,
}

impl Blocker {
    fn active(&self, now: Instant) -> bool {
        self.ongoing || now.duration_since(self.last_event) < self.quiet
    }

    fn earliest_safe(&self, now: Instant) -> Instant {
        if self.ongoing {
            // Unknown end; the soonest a capture could be safe is a full
            // quiet interval from now.
            now + self.quiet
        } else {
            self.last_event + self.quiet
        }
    }
}

/// The scheduler's answer for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Capture,
    Defer {
        reason: &'static str,
        earliest: Instant,
    },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Routine capture cadence at sampler factor 1.0.
    pub base_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
        }
    }
}

/// Heuristic capture scheduler. Lives on the UI thread; `tick` is
/// non-blocking and returns immediately.
pub struct CaptureScheduler {
    config: SchedulerConfig,
    blockers: HashMap<BlockerKind, Blocker>,
    last_capture: Instant,
    /// Pending one-shot defensive captures: (due instant, reason).
    defensive: Vec<(Instant, &'static str)>,
    /// Sampler scale factor; 0.5 doubles the routine interval.
    cadence_factor: f32,
    /// Raised by the encoder while its queue is saturated.
    backpressure: Arc<AtomicBool>,
}

impl CaptureScheduler {
    pub fn new(config: SchedulerConfig, now: Instant) -> Self {
        Self {
            config,
            blockers: HashMap::new(),
            last_capture: now,
            defensive: Vec::new(),
            cadence_factor: 1.0,
            backpressure: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with the encoder; while set, routine captures defer.
    pub fn backpressure_flag(&self) -> Arc<AtomicBool> {
        self.backpressure.clone()
    }

    /// Record a UI activity, refreshing its blocker window.
    pub fn note_activity(&mut self, activity: UiActivity, now: Instant) {
        let (kind, quiet, span) = activity.blocker();
        let entry = self.blockers.entry(kind).or_insert(Blocker {
            last_event: now,
            quiet,
            ongoing: false,
        });
        entry.last_event = now;
        entry.quiet = quiet;
        if let Some(opening) = span {
            entry.ongoing = opening;
        }
    }

    /// Scroll-offset report from the observation layer. While the view is
    /// past its content edges it is bouncing; bouncing counts as a scroll
    /// event with the longer bounce quiet interval.
    #[allow(clippy::too_many_arguments)]
    pub fn note_scroll_offset(
        &mut self,
        offset_y: f32,
        top_inset: f32,
        bottom_inset: f32,
        content_height: f32,
        visible_height: f32,
        now: Instant,
    ) {
        let above = offset_y < -top_inset - BOUNCE_EPSILON;
        let below =
            offset_y > content_height - visible_height + bottom_inset + BOUNCE_EPSILON;
        if above || below {
            self.note_activity(UiActivity::ScrollBounce, now);
        }
    }

    /// Schedule a one-shot capture at `now + delay`.
    pub fn request_defensive(&mut self, delay: Duration, reason: &'static str, now: Instant) {
        self.defensive.push((now + delay, reason));
    }

    /// Cancel pending defensive captures (stop/teardown path).
    pub fn cancel_defensive(&mut self) {
        self.defensive.clear();
    }

    /// Update the cadence scale from the adaptive sampler.
    pub fn set_cadence_factor(&mut self, factor: f32) {
        self.cadence_factor = if factor.is_finite() && factor > 0.0 {
            factor.min(1.0)
        } else {
            1.0
        };
    }

    fn effective_interval(&self) -> Duration {
        self.config.base_interval.div_f32(self.cadence_factor)
    }

    /// The routine-capture gate: has the heartbeat interval elapsed?
    fn heartbeat_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_capture) >= self.effective_interval()
    }

    fn defensive_due(&self, now: Instant) -> bool {
        self.defensive.iter().any(|(due, _)| *due <= now)
    }

    /// Decide whether "now" is a safe moment to capture.
    pub fn tick(&mut self, now: Instant) -> Decision {
        // Blockers first: motion always wins over any pending capture.
        if let Some((kind, blocker)) = self
            .blockers
            .iter()
            .filter(|(_, b)| b.active(now))
            .max_by_key(|(_, b)| b.earliest_safe(now))
        {
            return Decision::Defer {
                reason: kind.reason(),
                earliest: blocker.earliest_safe(now),
            };
        }

        if self.backpressure.load(Ordering::Relaxed) {
            return Decision::Defer {
                reason: "encoder_backpressure",
                earliest: now + BACKPRESSURE_RECHECK,
            };
        }

        if self.defensive_due(now) || self.heartbeat_due(now) {
            return Decision::Capture;
        }

        let next_defensive = self.defensive.iter().map(|(due, _)| *due).min();
        let next_heartbeat = self.last_capture + self.effective_interval();
        Decision::Defer {
            reason: "heartbeat",
            earliest: next_defensive.unwrap_or(next_heartbeat).min(next_heartbeat),
        }
    }

    /// A capture completed. Resets the heartbeat and consumes any defensive
    /// shots that were due, so a routine capture is not issued back-to-back
    /// with a defensive one.
    pub fn mark_captured(&mut self, now: Instant) {
        self.last_capture = now;
        self.defensive.retain(|(due, _)| *due > now);
    }

    /// A capture attempt yielded no frame (e.g. no key window). Treated as
    /// an immediate defer; nothing is retried until the next tick.
    pub fn capture_failed(&mut self, reason: &str) {
        debug!("capture attempt yielded no frame: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(now: Instant) -> CaptureScheduler {
        CaptureScheduler::new(SchedulerConfig::default(), now)
    }

    fn capture_at(s: &mut CaptureScheduler, now: Instant) -> bool {
        matches!(s.tick(now), Decision::Capture)
    }

    #[test]
    fn test_heartbeat_cadence() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        // Not due immediately after construction.
        assert!(!capture_at(&mut s, t0));
        assert!(capture_at(&mut s, t0 + Duration::from_secs(1)));
        s.mark_captured(t0 + Duration::from_secs(1));
        assert!(!capture_at(&mut s, t0 + Duration::from_millis(1500)));
        assert!(capture_at(&mut s, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_touch_blocker_defers() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.note_activity(UiActivity::TouchEnd, t0 + Duration::from_secs(1));
        match s.tick(t0 + Duration::from_secs(1)) {
            Decision::Defer { reason, earliest } => {
                assert_eq!(reason, "touch");
                assert_eq!(earliest, t0 + Duration::from_secs(1) + TOUCH_QUIET);
            }
            d => panic!("expected defer, got {:?}", d),
        }
        // Quiet interval elapsed — capture is allowed again.
        assert!(capture_at(&mut s, t0 + Duration::from_secs(1) + TOUCH_QUIET));
    }

    #[test]
    fn test_ongoing_span_blocks_past_quiet_interval() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.note_activity(UiActivity::ScrollBegin, t0);
        // Far beyond the scroll quiet interval, but the span never ended.
        assert!(!capture_at(&mut s, t0 + Duration::from_secs(5)));
        s.note_activity(UiActivity::ScrollEnd, t0 + Duration::from_secs(5));
        assert!(!capture_at(&mut s, t0 + Duration::from_secs(5) + Duration::from_millis(100)));
        assert!(capture_at(&mut s, t0 + Duration::from_secs(5) + SCROLL_QUIET));
    }

    #[test]
    fn test_earliest_safe_is_max_across_blockers() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        let t1 = t0 + Duration::from_secs(1);
        s.note_activity(UiActivity::Navigation, t1); // quiet 150ms
        s.note_activity(UiActivity::KeyboardAnimationEnd, t1); // quiet 300ms
        match s.tick(t1) {
            Decision::Defer { reason, earliest } => {
                assert_eq!(reason, "keyboard");
                assert_eq!(earliest, t1 + KEYBOARD_QUIET);
            }
            d => panic!("expected defer, got {:?}", d),
        }
    }

    #[test]
    fn test_bounce_extends_scroll_window() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        let t1 = t0 + Duration::from_secs(1);
        // Offset well past the top inset: bouncing.
        s.note_scroll_offset(-30.0, 0.0, 0.0, 2000.0, 800.0, t1);
        assert!(!capture_at(&mut s, t1 + SCROLL_QUIET));
        assert!(capture_at(&mut s, t1 + SCROLL_BOUNCE_QUIET));
    }

    #[test]
    fn test_bottom_bounce_detected() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        let t1 = t0 + Duration::from_secs(1);
        // content 2000, visible 800 => max settle offset 1200.
        s.note_scroll_offset(1230.0, 0.0, 0.0, 2000.0, 800.0, t1);
        assert!(!capture_at(&mut s, t1 + Duration::from_millis(300)));
        // In-range offset is not a bounce.
        let mut s2 = scheduler(t0);
        s2.note_scroll_offset(600.0, 0.0, 0.0, 2000.0, 800.0, t1);
        assert!(capture_at(&mut s2, t1));
    }

    #[test]
    fn test_defensive_fires_once_and_resets_heartbeat() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.mark_captured(t0);
        s.request_defensive(Duration::from_millis(180), "navigation", t0);
        // Not yet due.
        assert!(!capture_at(&mut s, t0 + Duration::from_millis(100)));
        // Due before the heartbeat would fire.
        let t_fire = t0 + Duration::from_millis(200);
        assert!(capture_at(&mut s, t_fire));
        s.mark_captured(t_fire);
        // The defensive shot was consumed and the heartbeat reset — no
        // back-to-back routine capture.
        assert!(!capture_at(&mut s, t0 + Duration::from_secs(1)));
        assert!(capture_at(&mut s, t_fire + Duration::from_secs(1)));
    }

    #[test]
    fn test_defensive_respects_blockers() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.request_defensive(Duration::from_millis(100), "gesture_end", t0);
        s.note_activity(UiActivity::TouchBegin, t0 + Duration::from_millis(50));
        assert!(!capture_at(&mut s, t0 + Duration::from_millis(150)));
        s.note_activity(UiActivity::TouchEnd, t0 + Duration::from_millis(200));
        assert!(capture_at(&mut s, t0 + Duration::from_millis(200) + TOUCH_QUIET));
    }

    #[test]
    fn test_cancel_defensive() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.mark_captured(t0);
        s.request_defensive(Duration::from_millis(100), "navigation", t0);
        s.cancel_defensive();
        assert!(!capture_at(&mut s, t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_cadence_factor_stretches_interval() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.set_cadence_factor(0.5);
        s.mark_captured(t0);
        assert!(!capture_at(&mut s, t0 + Duration::from_secs(1)));
        assert!(capture_at(&mut s, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn test_bad_cadence_factor_defaults_to_one() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        s.set_cadence_factor(f32::NAN);
        s.mark_captured(t0);
        assert!(capture_at(&mut s, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_backpressure_defers() {
        let t0 = Instant::now();
        let mut s = scheduler(t0);
        let flag = s.backpressure_flag();
        flag.store(true, Ordering::Relaxed);
        match s.tick(t0 + Duration::from_secs(2)) {
            Decision::Defer { reason, .. } => assert_eq!(reason, "encoder_backpressure"),
            d => panic!("expected defer, got {:?}", d),
        }
        flag.store(false, Ordering::Relaxed);
        assert!(capture_at(&mut s, t0 + Duration::from_secs(2)));
    }
}
