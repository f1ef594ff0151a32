// rejourney — session replay for mobile apps
// https://rejourney.co

//! Serialized per-session upload worker.
//!
//! One queue per session keeps segments in seq order and stops event-batch
//! prefix drops from interleaving. A failing segment blocks everything
//! behind it until it succeeds or exhausts its retries and is marked
//! failed. Once auth fails permanently the worker reports it exactly once
//! and drops the remaining jobs — the data stays buffered on disk for the
//! next boot.

use crate::client::UploadClient;
use rejourney_core::{SessionEvent, UploadError};
use rejourney_storage::{Segment, SegmentStore, UploadState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub enum UploadJob {
    Segment(Segment),
    Events {
        events: Vec<SessionEvent>,
        is_final: bool,
    },
    CrashReport(serde_json::Value),
    AnrReport(serde_json::Value),
}

/// Results reported back to the session controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    SegmentUploaded { seq: u32 },
    SegmentFailed { seq: u32, attempts: u32 },
    /// The controller drops exactly this prefix from its event buffer.
    EventsAccepted {
        accepted_count: usize,
        is_final: bool,
    },
    AuthFailed,
}

pub struct UploadQueue {
    tx: Option<mpsc::UnboundedSender<UploadJob>>,
    cancelled: Arc<AtomicBool>,
    worker: tokio::task::JoinHandle<()>,
}

impl UploadQueue {
    /// Spawn the worker. `store` is used only for per-segment upload-status
    /// records; segment commits stay with the encoder queue.
    pub fn spawn(
        client: Arc<UploadClient>,
        store: SegmentStore,
        outcome_tx: mpsc::UnboundedSender<UploadOutcome>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(client, store, rx, outcome_tx, cancelled.clone()));
        Self {
            tx: Some(tx),
            cancelled,
            worker,
        }
    }

    /// Queue a job; returns false once the worker is gone.
    pub fn enqueue(&self, job: UploadJob) -> bool {
        match &self.tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting work, skip not-yet-started jobs, and give the
    /// in-flight upload up to `deadline` to finish.
    pub async fn shutdown(mut self, deadline: Duration) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.tx.take();
        let abort = self.worker.abort_handle();
        if tokio::time::timeout(deadline, &mut self.worker).await.is_err() {
            warn!("upload queue exceeded shutdown deadline, aborting");
            abort.abort();
        }
    }

    /// Let the queue drain completely (no cancellation), bounded by
    /// `deadline`. Used for final flushes.
    pub async fn drain(mut self, deadline: Duration) {
        self.tx.take();
        let abort = self.worker.abort_handle();
        if tokio::time::timeout(deadline, &mut self.worker).await.is_err() {
            warn!("upload queue exceeded drain deadline, aborting");
            abort.abort();
        }
    }
}

async fn run_worker(
    client: Arc<UploadClient>,
    mut store: SegmentStore,
    mut rx: mpsc::UnboundedReceiver<UploadJob>,
    outcome_tx: mpsc::UnboundedSender<UploadOutcome>,
    cancelled: Arc<AtomicBool>,
) {
    info!("upload queue started for session {}", client.session_id());
    let mut auth_failure_reported = false;

    while let Some(job) = rx.recv().await {
        if cancelled.load(Ordering::Relaxed) {
            debug!("upload queue cancelled, skipping queued job");
            continue;
        }

        if client.auth_permanently_failed() {
            if !auth_failure_reported {
                auth_failure_reported = true;
                let _ = outcome_tx.send(UploadOutcome::AuthFailed);
            }
            continue;
        }

        match job {
            UploadJob::Segment(mut segment) => {
                if !segment.try_transition(UploadState::InFlight) {
                    debug!(
                        "segment {} not uploadable in state {:?}",
                        segment.seq, segment.upload_state
                    );
                    continue;
                }
                match client.upload_segment(&segment).await {
                    Ok(()) => {
                        segment.try_transition(UploadState::Uploaded);
                        if let Err(e) = store.mark_uploaded(segment.seq) {
                            warn!("could not record uploaded segment {}: {}", segment.seq, e);
                        }
                        let _ = outcome_tx.send(UploadOutcome::SegmentUploaded {
                            seq: segment.seq,
                        });
                    }
                    Err(e) => {
                        segment.try_transition(UploadState::Failed);
                        let attempts = segment.attempts + 1;
                        if let Err(e) = store.mark_failed(segment.seq, attempts) {
                            warn!("could not record failed segment {}: {}", segment.seq, e);
                        }
                        warn!("segment {} upload failed: {}", segment.seq, e);
                        report_auth_failure(&client, &outcome_tx, &mut auth_failure_reported, &e);
                        let _ = outcome_tx.send(UploadOutcome::SegmentFailed {
                            seq: segment.seq,
                            attempts,
                        });
                    }
                }
            }
            UploadJob::Events { events, is_final } => {
                if events.is_empty() {
                    let _ = outcome_tx.send(UploadOutcome::EventsAccepted {
                        accepted_count: 0,
                        is_final,
                    });
                    continue;
                }
                match client.upload_events(&events, is_final).await {
                    Ok(accepted) => {
                        let _ = outcome_tx.send(UploadOutcome::EventsAccepted {
                            accepted_count: accepted.accepted_count,
                            is_final,
                        });
                    }
                    Err(e) => {
                        warn!("events upload failed ({} events): {}", events.len(), e);
                        report_auth_failure(&client, &outcome_tx, &mut auth_failure_reported, &e);
                    }
                }
            }
            UploadJob::CrashReport(report) => {
                if let Err(e) = client.upload_crash_report(&report).await {
                    warn!("crash report upload failed: {}", e);
                    report_auth_failure(&client, &outcome_tx, &mut auth_failure_reported, &e);
                }
            }
            UploadJob::AnrReport(report) => {
                if let Err(e) = client.upload_anr_report(&report).await {
                    warn!("anr report upload failed: {}", e);
                    report_auth_failure(&client, &outcome_tx, &mut auth_failure_reported, &e);
                }
            }
        }
    }

    info!("upload queue stopped");
}

fn report_auth_failure(
    client: &UploadClient,
    outcome_tx: &mpsc::UnboundedSender<UploadOutcome>,
    reported: &mut bool,
    error: &UploadError,
) {
    if matches!(error, UploadError::AuthPermanent(_))
        && client.auth_permanently_failed()
        && !*reported
    {
        *reported = true;
        let _ = outcome_tx.send(UploadOutcome::AuthFailed);
    }
}
