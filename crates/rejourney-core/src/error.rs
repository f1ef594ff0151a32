// rejourney — session replay for mobile apps
// https://rejourney.co

//! Error taxonomy shared across the pipeline. Transient errors are retried
//! with backoff; permanent auth failures put the session in degraded mode;
//! invariant breaks drain the session without further uploads.

use thiserror::Error;

/// Failures surfaced by the uploader. Callers branch on the taxonomy, so
/// this is a closed enum rather than an `anyhow` chain.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Network failure or 5xx — retry with backoff.
    #[error("transient upload failure: {0}")]
    Transient(String),

    /// 401 — refresh the token and retry exactly once.
    #[error("auth token expired")]
    AuthExpired,

    /// 403/404 on a device-auth call — degraded mode until the next
    /// session starts.
    #[error("auth permanently failed (status {0})")]
    AuthPermanent(u16),

    /// Non-retriable server rejection.
    #[error("rejected by server (status {0})")]
    Rejected(u16),
}

impl UploadError {
    /// Classify an HTTP status. `None` means success (2xx, or 409 which the
    /// server uses for an already-accepted segment).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200..=299 | 409 => None,
            401 => Some(UploadError::AuthExpired),
            403 | 404 => Some(UploadError::AuthPermanent(status)),
            500..=599 => Some(UploadError::Transient(format!("http {}", status))),
            s => Some(UploadError::Rejected(s)),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }
}

/// Segment-store failures. IO errors are resource problems (drop the frame,
/// keep going); the rest are logic invariants fatal to the session.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("segment seq {0} already finalized")]
    AlreadyFinalized(u32),

    #[error("out-of-order segment commit: seq {got} after {last}")]
    OutOfOrderCommit { got: u32, last: u32 },

    #[error("no open segment")]
    NoOpenSegment,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Logic invariants are fatal to the session; IO is not.
    pub fn is_invariant(&self) -> bool {
        !matches!(self, StoreError::Io(_))
    }
}
