// rejourney — session replay for mobile apps
// https://rejourney.co

//! Pipeline counters, incremented from any thread with relaxed atomics and
//! logged as a single summary line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Counters shared across the capture, storage, and upload stages. Owned by
/// the session controller and cloned `Arc` downwards.
#[derive(Debug, Default)]
pub struct CoreTelemetry {
    pub frames_captured: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub frame_reorder_drop: AtomicU64,
    pub frame_backpressure_drop: AtomicU64,
    pub frame_resource_drop: AtomicU64,
    pub scan_bailouts: AtomicU64,
    pub segments_sealed: AtomicU64,
    pub segments_recovered: AtomicU64,
    pub uploads_ok: AtomicU64,
    pub uploads_failed: AtomicU64,
    pub upload_retries: AtomicU64,
    pub core_invariant_violation: AtomicU64,
}

impl CoreTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Record a broken internal invariant. The affected session is drained
    /// without further uploads; the counter makes the breakage visible.
    pub fn invariant_violation(&self, what: &str) {
        error!("core invariant violation: {}", what);
        Self::incr(&self.core_invariant_violation);
    }

    /// One info line with every counter — emitted at session end and on
    /// demand from the facade.
    pub fn log_summary(&self) {
        info!(
            "pipeline counters: captured={}, encoded={}, reorder_drop={}, backpressure_drop={}, resource_drop={}, scan_bailouts={}, sealed={}, recovered={}, uploads_ok={}, uploads_failed={}, retries={}, invariants={}",
            Self::get(&self.frames_captured),
            Self::get(&self.frames_encoded),
            Self::get(&self.frame_reorder_drop),
            Self::get(&self.frame_backpressure_drop),
            Self::get(&self.frame_resource_drop),
            Self::get(&self.scan_bailouts),
            Self::get(&self.segments_sealed),
            Self::get(&self.segments_recovered),
            Self::get(&self.uploads_ok),
            Self::get(&self.uploads_failed),
            Self::get(&self.upload_retries),
            Self::get(&self.core_invariant_violation),
        );
    }
}
