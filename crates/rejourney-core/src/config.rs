// rejourney — session replay for mobile apps
// https://rejourney.co

//! Remote configuration and the per-session frozen snapshot.
//!
//! The remote fetch returns a JSON object where every field is optional;
//! unknown fields are ignored so the server can ship new knobs without
//! breaking older SDKs. The snapshot is resolved once per session and the
//! sample-admission decision is frozen at first resolution.

use serde::Deserialize;

/// Raw remote config as fetched from the API. All fields optional with
/// documented defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    /// Master kill switch; false stops the session immediately.
    pub rejourney_enabled: bool,
    /// Video capture enable; false means data-only mode.
    pub recording_enabled: bool,
    /// Percentage 0-100; out-of-range values are clamped.
    pub sample_rate: i64,
    pub max_recording_minutes: u32,
    /// True behaves as `recording_enabled = false`.
    pub billing_blocked: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            rejourney_enabled: true,
            recording_enabled: true,
            sample_rate: 100,
            max_recording_minutes: 10,
            billing_blocked: false,
        }
    }
}

/// Frozen per-session resolution of the remote config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub sdk_enabled: bool,
    pub recording_enabled: bool,
    pub sample_rate_percent: u8,
    pub max_session_minutes: u16,
    pub billing_blocked: bool,
}

impl ConfigSnapshot {
    /// Whether video capture is allowed at all (before admission).
    pub fn recording_allowed(&self) -> bool {
        self.sdk_enabled && self.recording_enabled && !self.billing_blocked
    }

    pub fn max_session_secs(&self) -> u64 {
        self.max_session_minutes as u64 * 60
    }
}

impl From<RemoteConfig> for ConfigSnapshot {
    fn from(remote: RemoteConfig) -> Self {
        Self {
            sdk_enabled: remote.rejourney_enabled,
            recording_enabled: remote.recording_enabled,
            sample_rate_percent: remote.sample_rate.clamp(0, 100) as u8,
            max_session_minutes: remote.max_recording_minutes.clamp(1, u16::MAX as u32) as u16,
            billing_blocked: remote.billing_blocked,
        }
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        RemoteConfig::default().into()
    }
}

/// Roll the once-per-session sample admission. The boundaries are
/// deterministic: 0 never admits, 100 always admits.
pub fn roll_admission(sample_rate_percent: u8) -> bool {
    match sample_rate_percent {
        0 => false,
        p if p >= 100 => true,
        p => fastrand::u8(0..100) < p,
    }
}
