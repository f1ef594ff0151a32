// rejourney — session replay for mobile apps
// https://rejourney.co

//! Session lifecycle: the controller state machine that owns the capture
//! pipeline end to end, the promotion evaluator that scores finished
//! sessions, and the facade notifications surfaced to the embedding app.

pub mod controller;
pub mod promotion;

pub use controller::{
    ControllerConfig, SdkNotification, SessionController, SessionPhase, BACKGROUND_TIMEOUT,
    FINAL_FLUSH_DEADLINE,
};
pub use promotion::{promotion_score, should_promote, SessionMetrics, PROMOTION_THRESHOLD};
