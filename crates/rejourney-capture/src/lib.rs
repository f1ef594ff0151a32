// rejourney — session replay for mobile apps
// https://rejourney.co

//! Frame acquisition side of the capture core: the heuristic capture
//! scheduler, the budgeted view-hierarchy scanner, the privacy redactor,
//! and the adaptive sampler. Everything here runs on (or is driven from)
//! the UI thread and must stay inside soft-real-time budgets.

pub mod frame;
pub mod redactor;
pub mod sampler;
pub mod scanner;
pub mod scheduler;

pub use frame::Frame;
pub use redactor::Redactor;
pub use sampler::AdaptiveSampler;
pub use scanner::{HierarchyScanner, MaskRegistry, NoProbe, ScannerConfig, SurfaceProbe, ViewNode};
pub use scheduler::{CaptureScheduler, Decision, SchedulerConfig, UiActivity};
