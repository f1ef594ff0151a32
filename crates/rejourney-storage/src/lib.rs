// rejourney — session replay for mobile apps
// https://rejourney.co

//! Durable side of the capture core: the crash-safe segment store, the
//! frame encoder worker that feeds it, the ordered event buffer, and the
//! small durable key-value seam used for crash attribution.

pub mod encoder;
pub mod event_buffer;
pub mod kv;
pub mod segment;
pub mod store;

pub use encoder::{EncoderConfig, FrameEncoder};
pub use event_buffer::EventBuffer;
pub use kv::{DurableKv, FileKv, CURRENT_SESSION_KEY};
pub use segment::{Segment, UploadState};
pub use store::{
    list_recoverable, purge_session, remove_crash_report, RecoveredSession, SegmentHandle,
    SegmentStore, SessionMeta,
};
