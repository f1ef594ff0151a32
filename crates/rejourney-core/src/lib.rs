// rejourney — session replay for mobile apps
// https://rejourney.co

//! Shared types for the rejourney capture core: session identity, geometry,
//! the event model, remote config resolution, pipeline telemetry, and the
//! error taxonomy used across the capture/storage/upload crates.

pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod ids;
pub mod telemetry;
pub mod time;

pub use config::{roll_admission, ConfigSnapshot, RemoteConfig};
pub use error::{StoreError, UploadError};
pub use events::{EventData, GestureKind, NavigationSource, SessionEvent};
pub use geometry::{Rect, SensitiveKind, SensitiveRegionSet};
pub use ids::SessionId;
pub use telemetry::CoreTelemetry;
