// rejourney — session replay for mobile apps
// https://rejourney.co

//! Session promotion scoring.
//!
//! At session end the controller scores the session's signals; sessions at
//! or above the threshold have their visual data promoted to longer
//! server-side retention. The score is a sum of independent weighted
//! signals, clamped to non-negative.

use serde::{Deserialize, Serialize};

/// Sessions scoring at least this are promoted.
pub const PROMOTION_THRESHOLD: f32 = 0.25;

/// Signals accumulated over one session, serialized as the promotion
/// request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub crash_count: u32,
    pub anr_count: u32,
    pub api_error_count: u32,
    pub error_count: u32,
    pub rage_tap_count: u32,
    pub dead_tap_count: u32,
    pub avg_api_latency_ms: f64,
    pub duration_seconds: f64,
    pub startup_time_ms: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub touch_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_success_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_total_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_event_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_constrained: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_expensive: Option<bool>,
}

/// Weighted rubric. Each predicate contributes independently; the result
/// is clamped to `>= 0`.
pub fn promotion_score(m: &SessionMetrics) -> f32 {
    let mut score = 0.0f32;

    if m.api_error_count >= 1 {
        score += 0.40;
    }
    if m.error_count >= 1 {
        score += 0.35;
    }
    if m.avg_api_latency_ms >= 300.0 {
        score += 0.30;
    }
    if m.startup_time_ms >= 1500.0 {
        score += 0.25;
    }
    if m.duration_seconds >= 120.0 {
        score += 0.20;
    }
    if m.custom_event_count.unwrap_or(0) >= 2 {
        score += 0.15;
    }
    if m.is_constrained == Some(true) {
        score += 0.20;
    }
    if m.is_expensive == Some(true) {
        score += 0.15;
    }
    // A handful of touches over a whole session reads as confusion, not
    // engagement.
    if let Some(touches) = m.touch_count {
        if touches > 0 && touches < 5 {
            score -= 0.15;
        }
    }

    // Interaction density per minute.
    if m.duration_seconds > 6.0 {
        let touches = m.touch_count.unwrap_or(0) as f64;
        let scrolls = m.scroll_count.unwrap_or(0) as f64;
        let density = (touches + 0.5 * scrolls) / (m.duration_seconds / 60.0);
        if density > 15.0 {
            score += 0.20;
        } else if density > 5.0 {
            score += 0.10;
        }
    }

    // API failure rate, once there are enough calls to mean something.
    if let Some(total) = m.api_total_count {
        if total >= 3 {
            let rate = m.api_error_count as f64 / total as f64;
            if rate > 0.20 {
                score += 0.25;
            } else if rate > 0.0 {
                score += 0.10;
            }
        }
    }

    if m.screen_count.unwrap_or(0) >= 3 {
        score += 0.15;
    }

    score.max(0.0)
}

pub fn should_promote(m: &SessionMetrics) -> bool {
    promotion_score(m) >= PROMOTION_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_session_scores_zero() {
        let m = SessionMetrics {
            duration_seconds: 3.0,
            ..Default::default()
        };
        assert_eq!(promotion_score(&m), 0.0);
        assert!(!should_promote(&m));
    }

    #[test]
    fn test_single_api_error_promotes() {
        let m = SessionMetrics {
            api_error_count: 1,
            ..Default::default()
        };
        assert!((promotion_score(&m) - 0.40).abs() < 1e-6);
        assert!(should_promote(&m));
    }

    #[test]
    fn test_weights_sum_independently() {
        let m = SessionMetrics {
            api_error_count: 1,     // +0.40
            error_count: 2,         // +0.35
            avg_api_latency_ms: 350.0, // +0.30
            startup_time_ms: 2000.0,   // +0.25
            duration_seconds: 130.0,   // +0.20
            custom_event_count: Some(2), // +0.15
            is_constrained: Some(true),  // +0.20
            is_expensive: Some(true),    // +0.15
            ..Default::default()
        };
        assert!((promotion_score(&m) - 2.00).abs() < 1e-6);
    }

    #[test]
    fn test_low_touch_penalty_clamps_at_zero() {
        let m = SessionMetrics {
            touch_count: Some(2),
            duration_seconds: 3.0,
            ..Default::default()
        };
        assert_eq!(promotion_score(&m), 0.0);
    }

    #[test]
    fn test_low_touch_penalty_applies() {
        let m = SessionMetrics {
            api_error_count: 1,
            touch_count: Some(3),
            ..Default::default()
        };
        assert!((promotion_score(&m) - 0.25).abs() < 1e-6);
        // Zero touches is not "low touches" — no penalty.
        let m = SessionMetrics {
            api_error_count: 1,
            touch_count: Some(0),
            ..Default::default()
        };
        assert!((promotion_score(&m) - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_interaction_density_tiers() {
        // 60 touches in 2 minutes => 30/min.
        let busy = SessionMetrics {
            duration_seconds: 120.0,
            touch_count: Some(60),
            ..Default::default()
        };
        // +0.20 duration, +0.20 density.
        assert!((promotion_score(&busy) - 0.40).abs() < 1e-6);

        // 12 touches + 4 scrolls in 2 minutes => 7/min.
        let moderate = SessionMetrics {
            duration_seconds: 120.0,
            touch_count: Some(12),
            scroll_count: Some(4),
            ..Default::default()
        };
        assert!((promotion_score(&moderate) - 0.30).abs() < 1e-6);

        // Short sessions skip the density signal entirely.
        let short = SessionMetrics {
            duration_seconds: 5.0,
            touch_count: Some(60),
            ..Default::default()
        };
        assert_eq!(promotion_score(&short), 0.0);
    }

    #[test]
    fn test_api_failure_rate_tiers() {
        let high = SessionMetrics {
            api_error_count: 1,
            api_total_count: Some(4), // 25% failure
            ..Default::default()
        };
        assert!((promotion_score(&high) - 0.65).abs() < 1e-6);

        let low = SessionMetrics {
            api_error_count: 1,
            api_total_count: Some(10), // 10% failure
            ..Default::default()
        };
        assert!((promotion_score(&low) - 0.50).abs() < 1e-6);

        // Below three calls the rate is noise and is ignored.
        let sparse = SessionMetrics {
            api_error_count: 1,
            api_total_count: Some(2),
            ..Default::default()
        };
        assert!((promotion_score(&sparse) - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_screen_discovery() {
        let m = SessionMetrics {
            screen_count: Some(3),
            api_error_count: 1,
            ..Default::default()
        };
        assert!((promotion_score(&m) - 0.55).abs() < 1e-6);
    }

    #[test]
    fn test_monotone_in_direct_fields() {
        // Raising a direct-sense signal never lowers the score.
        let base = SessionMetrics {
            duration_seconds: 30.0,
            ..Default::default()
        };
        let base_score = promotion_score(&base);

        for api_errors in 0..10 {
            let mut m = base.clone();
            m.api_error_count = api_errors;
            assert!(promotion_score(&m) >= base_score);
        }
        let mut last = 0.0;
        for errors in 0..10 {
            let mut m = base.clone();
            m.error_count = errors;
            let s = promotion_score(&m);
            assert!(s >= last);
            last = s;
        }
        let mut last = 0.0;
        for duration in [1.0, 30.0, 119.0, 120.0, 600.0] {
            let mut m = base.clone();
            m.duration_seconds = duration;
            let s = promotion_score(&m);
            assert!(s >= last);
            last = s;
        }
        let mut last = 0.0;
        for latency in [0.0, 299.0, 300.0, 5000.0] {
            let mut m = base.clone();
            m.avg_api_latency_ms = latency;
            let s = promotion_score(&m);
            assert!(s >= last);
            last = s;
        }
    }

    #[test]
    fn test_metrics_serialize_camel_case() {
        let m = SessionMetrics {
            api_error_count: 2,
            screen_count: Some(4),
            ..Default::default()
        };
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["apiErrorCount"], 2);
        assert_eq!(json["screenCount"], 4);
        assert!(json.get("touchCount").is_none());
    }
}
