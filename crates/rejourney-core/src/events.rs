// rejourney — session replay for mobile apps
// https://rejourney.co

//! Discrete session events, serialized as compact tagged JSON for the
//! events upload endpoint.

use crate::geometry::Rect;
use serde::{Deserialize, Serialize};

/// A discrete event with its wall-clock timestamp (epoch ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: u64,

    #[serde(flatten)]
    pub data: EventData,
}

impl SessionEvent {
    pub fn new(timestamp: u64, data: EventData) -> Self {
        Self { timestamp, data }
    }
}

/// Event payload - tagged union over everything the core records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventData {
    #[serde(rename_all = "camelCase")]
    SessionStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_session_id: Option<String>,
        /// Background time accumulated by the previous session, seconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        background_duration: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    SessionEnd { reason: String },

    #[serde(rename_all = "camelCase")]
    Navigation {
        screen_name: String,
        source: NavigationSource,
    },

    #[serde(rename_all = "camelCase")]
    Gesture {
        kind: GestureKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_label: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Motion { kind: String },

    /// Keyboard became visible; `frame` is the keyboard's window rect.
    #[serde(rename_all = "camelCase")]
    KeyboardShow { frame: Rect },

    #[serde(rename_all = "camelCase")]
    KeyboardHide { key_press_count: u32 },

    /// Coalesced typing burst — see `EventBuffer` for the merge rule.
    #[serde(rename_all = "camelCase")]
    KeyboardTyping { key_press_count: u32 },

    VisualChange,

    AppBackground,

    AppForeground,

    AppTerminated,

    #[serde(rename_all = "camelCase")]
    ExternalUrl { scheme: String },

    #[serde(rename_all = "camelCase")]
    OauthStarted { provider: String },

    #[serde(rename_all = "camelCase")]
    OauthCompleted { provider: String, success: bool },

    #[serde(rename_all = "camelCase")]
    OauthReturned { provider: String },

    #[serde(rename_all = "camelCase")]
    Anr {
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_state: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Crash { reason: String },

    #[serde(rename_all = "camelCase")]
    UserIdentityChanged { user_tag: String },

    #[serde(rename_all = "camelCase")]
    AppStartup { duration_ms: u64 },
}

/// How a navigation was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NavigationSource {
    Auto,
    Js,
}

/// Gesture classification reported by the native recognizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GestureKind {
    Tap,
    DoubleTap,
    LongPress,
    Swipe,
    Pinch,
    RageTap,
    DeadTap,
}
