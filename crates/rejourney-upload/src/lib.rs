// rejourney — session replay for mobile apps
// https://rejourney.co

//! Network side of the capture core: the token-authenticated upload client
//! with retry/backoff, the serialized per-session upload queue, and the
//! background-task escrow guards used while the app is backgrounded.

pub mod auth;
pub mod background;
pub mod client;
pub mod queue;

pub use auth::{AuthToken, StaticTokenProvider, TokenProvider};
pub use background::{BackgroundTaskGuard, BackgroundTaskHost, NoopBackgroundHost};
pub use client::{EventsAccepted, RetryPolicy, UploadClient};
pub use queue::{UploadJob, UploadOutcome, UploadQueue};
