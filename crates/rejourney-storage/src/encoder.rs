// rejourney — session replay for mobile apps
// https://rejourney.co

//! Frame encoder worker.
//!
//! The UI thread hands redacted frames into a bounded queue and returns
//! immediately; a serial worker drains the queue, compresses each frame,
//! and appends it to the open segment. Segments seal on duration, frame
//! count, or an explicit flush, and are handed to the uploader through a
//! channel. When the queue saturates the oldest frame is dropped and the
//! scheduler's backpressure flag raised until the queue drains.

use crate::store::{SegmentHandle, SegmentStore};
use crate::Segment;
use crossbeam::queue::ArrayQueue;
use image::codecs::jpeg::JpegEncoder;
use rejourney_capture::{AdaptiveSampler, Frame};
use rejourney_core::CoreTelemetry;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Seal the open segment once it spans this much wall time.
    pub max_segment_duration: Duration,
    /// Seal the open segment once it holds this many frames.
    pub max_segment_frames: u32,
    /// Bounded queue capacity between the UI thread and the worker.
    pub max_frames_in_memory: usize,
    /// JPEG quality before the sampler's scale is applied.
    pub base_quality: u8,
    /// Worker poll sleep while the queue is empty.
    pub poll_interval: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_segment_duration: Duration::from_secs(10),
            max_segment_frames: 60,
            max_frames_in_memory: 20,
            base_quality: 80,
            poll_interval: Duration::from_millis(50),
        }
    }
}

enum EncoderCommand {
    Flush(oneshot::Sender<()>),
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
}

struct OpenSegment {
    handle: SegmentHandle,
    opened_at: Instant,
}

/// Handle side of the encoder, held by the session controller. All methods
/// are non-blocking except the explicitly async flush/stop.
pub struct FrameEncoder {
    queue: Arc<ArrayQueue<Frame>>,
    cmd_tx: mpsc::UnboundedSender<EncoderCommand>,
    open: Arc<Mutex<Option<OpenSegment>>>,
    backpressure: Arc<AtomicBool>,
    telemetry: Arc<CoreTelemetry>,
}

impl FrameEncoder {
    /// Spawn the worker on the current tokio runtime. Sealed segments
    /// arrive on the returned receiver in seq order.
    pub fn spawn(
        store: SegmentStore,
        config: EncoderConfig,
        sampler: Arc<AdaptiveSampler>,
        telemetry: Arc<CoreTelemetry>,
        backpressure: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<Segment>) {
        let queue = Arc::new(ArrayQueue::new(config.max_frames_in_memory.max(1)));
        let open = Arc::new(Mutex::new(None));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sealed_tx, sealed_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            store,
            config,
            sampler,
            telemetry: telemetry.clone(),
            queue: queue.clone(),
            open: open.clone(),
            backpressure: backpressure.clone(),
            sealed_tx,
            next_seq: 0,
            last_appended_ts: 0,
            paused: false,
        };
        tokio::spawn(worker.run(cmd_rx));

        (
            Self {
                queue,
                cmd_tx,
                open,
                backpressure,
                telemetry,
            },
            sealed_rx,
        )
    }

    /// Hand a frame to the worker. Never blocks: a full queue displaces
    /// the oldest queued frame and raises the backpressure flag.
    pub fn append(&self, frame: Frame) {
        if let Some(displaced) = self.queue.force_push(frame) {
            drop(displaced);
            CoreTelemetry::incr(&self.telemetry.frame_backpressure_drop);
            self.backpressure.store(true, Ordering::Relaxed);
            warn!("encoder queue saturated, dropped oldest queued frame");
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop consuming frames (background entry). Queued and new frames are
    /// discarded until `resume`.
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(EncoderCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(EncoderCommand::Resume);
    }

    /// Drain the queue and seal the open segment. Idempotent; returns once
    /// the segment has been written and indexed. A no-op when the worker
    /// has already stopped.
    pub async fn flush_now(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(EncoderCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush, seal, and terminate the worker.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(EncoderCommand::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Pre-crash seal of the open segment. Synchronous, allocation-free:
    /// writes the terminal trailer through the already-open file handle and
    /// syncs. The partial segment becomes recoverable-as-finalized on the
    /// next boot; without the trailer it would be deleted during recovery.
    pub fn emergency_flush_sync(&self) {
        let mut open = lock_ignore_poison(&self.open);
        if let Some(seg) = open.as_mut() {
            let _ = seg.handle.emergency_seal();
        }
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    store: SegmentStore,
    config: EncoderConfig,
    sampler: Arc<AdaptiveSampler>,
    telemetry: Arc<CoreTelemetry>,
    queue: Arc<ArrayQueue<Frame>>,
    open: Arc<Mutex<Option<OpenSegment>>>,
    backpressure: Arc<AtomicBool>,
    sealed_tx: mpsc::UnboundedSender<Segment>,
    next_seq: u32,
    last_appended_ts: u64,
    paused: bool,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<EncoderCommand>) {
        info!("frame encoder started for session {}", self.store.session_id());

        'outer: loop {
            // Commands first so flush/stop never wait behind frame work.
            loop {
                match cmd_rx.try_recv() {
                    Ok(EncoderCommand::Flush(ack)) => {
                        self.drain_queue();
                        self.seal_open("flush");
                        let _ = ack.send(());
                    }
                    Ok(EncoderCommand::Pause) => self.paused = true,
                    Ok(EncoderCommand::Resume) => self.paused = false,
                    Ok(EncoderCommand::Stop(ack)) => {
                        self.drain_queue();
                        self.seal_open("stop");
                        let _ = ack.send(());
                        break 'outer;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        // Handle vanished without a stop — process teardown.
                        // Leave the open segment to the recovery sweep.
                        debug!("encoder handle dropped, worker exiting");
                        break 'outer;
                    }
                }
            }

            let worked = match self.queue.pop() {
                Some(frame) => {
                    self.handle_frame(frame);
                    true
                }
                None => false,
            };

            self.seal_if_needed(Instant::now());

            // Queue drained past the halfway mark — let the scheduler
            // resume routine captures.
            if self.queue.len() * 2 <= self.config.max_frames_in_memory {
                self.backpressure.store(false, Ordering::Relaxed);
            }

            if !worked {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        info!("frame encoder stopped");
    }

    fn drain_queue(&mut self) {
        while let Some(frame) = self.queue.pop() {
            self.handle_frame(frame);
        }
        self.backpressure.store(false, Ordering::Relaxed);
    }

    fn handle_frame(&mut self, frame: Frame) {
        if self.paused {
            debug!("encoder paused, dropping frame");
            return;
        }

        // Frames append in capture order; queue delay can reorder.
        if frame.wall_ms < self.last_appended_ts {
            CoreTelemetry::incr(&self.telemetry.frame_reorder_drop);
            debug!(
                "dropping out-of-order frame: {} < {}",
                frame.wall_ms, self.last_appended_ts
            );
            return;
        }

        let quality = self.sampler.scaled_quality(self.config.base_quality);
        let wall_ms = frame.wall_ms;
        let rgb = image::DynamicImage::ImageRgba8(frame.image).to_rgb8();
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality);
        if let Err(e) = encoder.encode_image(&rgb) {
            warn!("frame compression failed, dropping frame: {}", e);
            CoreTelemetry::incr(&self.telemetry.frame_resource_drop);
            return;
        }

        let mut open = lock_ignore_poison(&self.open);
        if open.is_none() {
            match self.store.begin_segment(self.next_seq, wall_ms) {
                Ok(handle) => {
                    *open = Some(OpenSegment {
                        handle,
                        opened_at: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!("could not open segment {}: {}", self.next_seq, e);
                    CoreTelemetry::incr(&self.telemetry.frame_resource_drop);
                    return;
                }
            }
        }

        let Some(seg) = open.as_mut() else { return };
        match seg.handle.append_frame(wall_ms, &jpeg) {
            Ok(()) => {
                self.last_appended_ts = wall_ms;
                CoreTelemetry::incr(&self.telemetry.frames_encoded);
            }
            Err(e) => {
                warn!("segment append failed, dropping frame: {}", e);
                CoreTelemetry::incr(&self.telemetry.frame_resource_drop);
            }
        }
    }

    fn seal_if_needed(&mut self, now: Instant) {
        let due = {
            let open = lock_ignore_poison(&self.open);
            match open.as_ref() {
                Some(seg) => {
                    seg.handle.frame_count() >= self.config.max_segment_frames
                        || now.duration_since(seg.opened_at) >= self.config.max_segment_duration
                }
                None => false,
            }
        };
        if due {
            self.seal_open("boundary");
        }
    }

    fn seal_open(&mut self, reason: &str) {
        let Some(seg) = lock_ignore_poison(&self.open).take() else {
            return;
        };
        let seq = seg.handle.seq();
        let frames = seg.handle.frame_count();
        let end_ts = seg.handle.last_frame_ts().max(seg.handle.start_ts());

        match self.store.commit_segment(seg.handle, end_ts, frames) {
            Ok(segment) => {
                self.next_seq = seq + 1;
                CoreTelemetry::incr(&self.telemetry.segments_sealed);
                debug!(
                    "segment sealed ({}): seq={}, frames={}",
                    reason, seq, frames
                );
                let _ = self.sealed_tx.send(segment);
            }
            Err(e) if e.is_invariant() => {
                // Fatal to this session: stop producing segments.
                self.telemetry.invariant_violation(&e.to_string());
                self.paused = true;
            }
            Err(e) => {
                warn!("segment {} commit failed: {}", seq, e);
                CoreTelemetry::incr(&self.telemetry.frame_resource_drop);
            }
        }
    }
}
