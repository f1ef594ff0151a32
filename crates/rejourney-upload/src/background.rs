// rejourney — session replay for mobile apps
// https://rejourney.co

//! Background-task escrow.
//!
//! After the process enters the background the OS grants a short slice of
//! wall clock; uploads running in that window must hold a task handle and
//! release it on every exit path. The guard releases on drop, so success,
//! timeout, and panic unwinding all return the escrow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Platform hook that escrows background execution time.
pub trait BackgroundTaskHost: Send + Sync {
    fn begin(&self, name: &str) -> u64;
    fn end(&self, handle: u64);
}

/// Host for platforms (and tests) without an escrow mechanism; hands out
/// ids so guard bookkeeping still round-trips.
#[derive(Debug, Default)]
pub struct NoopBackgroundHost {
    next: AtomicU64,
    open: AtomicU64,
}

impl NoopBackgroundHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of currently unreleased handles (test observability).
    pub fn open_count(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }
}

impl BackgroundTaskHost for NoopBackgroundHost {
    fn begin(&self, _name: &str) -> u64 {
        self.open.fetch_add(1, Ordering::Relaxed);
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn end(&self, _handle: u64) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII wrapper around a background task handle.
pub struct BackgroundTaskGuard {
    host: Arc<dyn BackgroundTaskHost>,
    handle: Option<u64>,
    name: String,
}

impl BackgroundTaskGuard {
    pub fn begin(host: Arc<dyn BackgroundTaskHost>, name: impl Into<String>) -> Self {
        let name = name.into();
        let handle = host.begin(&name);
        debug!("background task '{}' started (handle {})", name, handle);
        Self {
            host,
            handle: Some(handle),
            name,
        }
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.host.end(handle);
            debug!("background task '{}' ended (handle {})", self.name, handle);
        }
    }
}

impl Drop for BackgroundTaskGuard {
    fn drop(&mut self) {
        self.release();
    }
}
