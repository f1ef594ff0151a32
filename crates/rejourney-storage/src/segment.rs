// rejourney — session replay for mobile apps
// https://rejourney.co

use rejourney_core::SessionId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upload lifecycle of a sealed segment. Transitions are compare-and-swap
/// guarded so the uploader queue and recovery never race a state backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadState {
    Pending,
    InFlight,
    Uploaded,
    Failed,
}

impl UploadState {
    /// Valid transitions: Pending→InFlight, InFlight→{Uploaded, Failed,
    /// Pending}, Failed→InFlight (retry on a later boot).
    pub fn can_transition(from: UploadState, to: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (from, to),
            (Pending, InFlight)
                | (InFlight, Uploaded)
                | (InFlight, Failed)
                | (InFlight, Pending)
                | (Failed, InFlight)
        )
    }
}

/// A time-bounded container of encoded frames, uploaded as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub session_id: SessionId,
    /// Sequence number within the session; uploads happen in this order.
    pub seq: u32,
    /// Epoch ms of the first and last frame.
    pub start_ts: u64,
    pub end_ts: u64,
    pub frame_count: u32,
    pub path: PathBuf,
    pub finalized: bool,
    pub upload_state: UploadState,
    /// Upload attempts so far, persisted so retry budgets survive restarts.
    pub attempts: u32,
}

impl Segment {
    /// A segment is uploaded iff it was finalized first.
    pub fn uploadable(&self) -> bool {
        self.finalized && self.upload_state != UploadState::Uploaded
    }

    /// CAS-style state change; returns false (and leaves the state alone)
    /// for an invalid transition.
    pub fn try_transition(&mut self, to: UploadState) -> bool {
        if UploadState::can_transition(self.upload_state, to) {
            self.upload_state = to;
            true
        } else {
            false
        }
    }
}
