// rejourney — session replay for mobile apps
// https://rejourney.co

//! Crash-safe on-disk segment index.
//!
//! Layout per session: `pending/{sessionId}/` holding `seg-{seq:08}.dat`
//! (finalized), `seg-{seq:08}.writing` (in flight), `index.log` (append-only
//! commit/status records), `events.jsonl`, `meta.json`, and `crash.json`.
//!
//! Commits are write-then-rename: the segment trailer and the index record
//! are flushed to disk before the `.writing` file takes its finalized name.
//! After any crash, [`list_recoverable`] returns exactly the segments whose
//! trailer made it to disk; bare `.writing` orphans are deleted.

use crate::segment::{Segment, UploadState};
use rejourney_core::{SessionEvent, SessionId, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_MAGIC: &[u8; 8] = b"RJSEGHDR";
const TRAILER_MAGIC: &[u8; 8] = b"RJSEGEND";
const HEADER_LEN: u64 = 24;
const TRAILER_LEN: u64 = 24;

const INDEX_FILE: &str = "index.log";
const EVENTS_FILE: &str = "events.jsonl";
const META_FILE: &str = "meta.json";
const CRASH_FILE: &str = "crash.json";
const PENDING_DIR: &str = "pending";

/// Last-known session metadata, rewritten on background entry and identity
/// changes so recovery has the numbers the timeout protocol needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
    pub started_at_ms: u64,
    pub background_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<String>,
}

/// Append-only records in `index.log`, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum IndexRecord {
    #[serde(rename_all = "camelCase")]
    Commit {
        seq: u32,
        start_ts: u64,
        end_ts: u64,
        frame_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        seq: u32,
        state: UploadState,
        attempts: u32,
    },
}

/// Open handle on an in-flight `.writing` segment file. The file handle is
/// kept so the emergency path can seal without reopening or allocating.
pub struct SegmentHandle {
    seq: u32,
    start_ts: u64,
    frame_count: u32,
    last_frame_ts: u64,
    file: File,
    writing_path: PathBuf,
}

impl SegmentHandle {
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn last_frame_ts(&self) -> u64 {
        self.last_frame_ts
    }

    /// Append one encoded frame record: `[ts u64][len u32][payload]`.
    pub fn append_frame(&mut self, ts: u64, payload: &[u8]) -> io::Result<()> {
        let mut record = [0u8; 12];
        record[..8].copy_from_slice(&ts.to_le_bytes());
        record[8..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.file.write_all(&record)?;
        self.file.write_all(payload)?;
        self.frame_count += 1;
        self.last_frame_ts = ts;
        Ok(())
    }

    /// Pre-crash seal: write the terminal trailer and sync, synchronously
    /// and without allocating. A `.writing` file carrying this trailer is
    /// promoted to finalized during recovery.
    pub fn emergency_seal(&mut self) -> io::Result<()> {
        let end_ts = if self.last_frame_ts > 0 {
            self.last_frame_ts
        } else {
            self.start_ts
        };
        self.file.write_all(&trailer_bytes(end_ts, self.frame_count))?;
        self.file.sync_all()
    }
}

fn header_bytes(seq: u32, start_ts: u64) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(HEADER_MAGIC);
    buf[8..12].copy_from_slice(&seq.to_le_bytes());
    buf[12..20].copy_from_slice(&start_ts.to_le_bytes());
    buf
}

fn trailer_bytes(end_ts: u64, frame_count: u32) -> [u8; TRAILER_LEN as usize] {
    let mut buf = [0u8; TRAILER_LEN as usize];
    buf[..8].copy_from_slice(TRAILER_MAGIC);
    buf[8..16].copy_from_slice(&end_ts.to_le_bytes());
    buf[16..20].copy_from_slice(&frame_count.to_le_bytes());
    buf
}

fn segment_file_name(seq: u32, finalized: bool) -> String {
    if finalized {
        format!("seg-{:08}.dat", seq)
    } else {
        format!("seg-{:08}.writing", seq)
    }
}

/// Crash-safe per-session segment index. Single writer: the encoder queue.
pub struct SegmentStore {
    session_id: SessionId,
    dir: PathBuf,
    index: File,
    last_committed_seq: Option<u32>,
}

impl SegmentStore {
    /// Open (or create) the per-session directory under `root/pending/`.
    pub fn open(root: &Path, session_id: SessionId) -> Result<Self, StoreError> {
        let dir = session_dir(root, session_id);
        fs::create_dir_all(&dir)?;
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(INDEX_FILE))?;
        Ok(Self {
            session_id,
            dir,
            index,
            last_committed_seq: None,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the `.writing` file for the next segment and stamp its header.
    pub fn begin_segment(&mut self, seq: u32, start_ts: u64) -> Result<SegmentHandle, StoreError> {
        let writing_path = self.dir.join(segment_file_name(seq, false));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&writing_path)?;
        file.write_all(&header_bytes(seq, start_ts))?;
        debug!("segment {} opened at {}", seq, writing_path.display());
        Ok(SegmentHandle {
            seq,
            start_ts,
            frame_count: 0,
            last_frame_ts: 0,
            file,
            writing_path,
        })
    }

    /// Finalize a segment: trailer + index record are flushed before the
    /// atomic rename to the finalized name.
    pub fn commit_segment(
        &mut self,
        handle: SegmentHandle,
        end_ts: u64,
        frame_count: u32,
    ) -> Result<Segment, StoreError> {
        let SegmentHandle {
            seq,
            start_ts,
            mut file,
            writing_path,
            ..
        } = handle;

        if let Some(last) = self.last_committed_seq {
            if seq == last {
                return Err(StoreError::AlreadyFinalized(seq));
            }
            if seq < last {
                return Err(StoreError::OutOfOrderCommit { got: seq, last });
            }
        }

        file.write_all(&trailer_bytes(end_ts, frame_count))?;
        file.sync_all()?;
        drop(file);

        self.append_index(&IndexRecord::Commit {
            seq,
            start_ts,
            end_ts,
            frame_count,
        })?;

        let final_path = self.dir.join(segment_file_name(seq, true));
        fs::rename(&writing_path, &final_path)?;
        self.last_committed_seq = Some(seq);
        debug!(
            "segment {} committed: frames={}, {}..{}",
            seq, frame_count, start_ts, end_ts
        );

        Ok(Segment {
            session_id: self.session_id,
            seq,
            start_ts,
            end_ts,
            frame_count,
            path: final_path,
            finalized: true,
            upload_state: UploadState::Pending,
            attempts: 0,
        })
    }

    /// Record a successful upload and reclaim the segment file.
    pub fn mark_uploaded(&mut self, seq: u32) -> Result<(), StoreError> {
        self.append_index(&IndexRecord::Status {
            seq,
            state: UploadState::Uploaded,
            attempts: 0,
        })?;
        let path = self.dir.join(segment_file_name(seq, true));
        if let Err(e) = fs::remove_file(&path) {
            debug!("could not remove uploaded segment {}: {}", path.display(), e);
        }
        Ok(())
    }

    pub fn mark_failed(&mut self, seq: u32, attempts: u32) -> Result<(), StoreError> {
        self.append_index(&IndexRecord::Status {
            seq,
            state: UploadState::Failed,
            attempts,
        })
    }

    fn append_index(&mut self, record: &IndexRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
        line.push(b'\n');
        self.index.write_all(&line)?;
        self.index.sync_all()?;
        Ok(())
    }

    /// Overwrite the persisted event buffer (background-entry snapshot).
    pub fn persist_events(&self, events: &[SessionEvent]) -> io::Result<()> {
        let mut out = Vec::new();
        for event in events {
            serde_json::to_writer(&mut out, event).map_err(io::Error::other)?;
            out.push(b'\n');
        }
        write_atomically(&self.dir.join(EVENTS_FILE), &out)
    }

    pub fn write_meta(&self, meta: &SessionMeta) -> io::Result<()> {
        let json = serde_json::to_vec(meta).map_err(io::Error::other)?;
        write_atomically(&self.dir.join(META_FILE), &json)
    }

    /// Persist a crash report for at-most-once upload on the next boot.
    pub fn write_crash_report(&self, report: &serde_json::Value) -> io::Result<()> {
        let json = serde_json::to_vec(report).map_err(io::Error::other)?;
        write_atomically(&self.dir.join(CRASH_FILE), &json)
    }
}

fn session_dir(root: &Path, session_id: SessionId) -> PathBuf {
    root.join(PENDING_DIR).join(session_id.to_string())
}

/// Write-then-rename so readers never observe a torn file.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Everything salvaged from one `pending/{sessionId}/` directory.
#[derive(Debug)]
pub struct RecoveredSession {
    pub session_id: SessionId,
    pub dir: PathBuf,
    /// Finalized-but-not-uploaded segments, in seq order.
    pub segments: Vec<Segment>,
    pub events: Vec<SessionEvent>,
    pub meta: Option<SessionMeta>,
    pub crash_report: Option<serde_json::Value>,
}

/// Startup sweep over `root/pending/`. Promotes `.writing` files that carry
/// a terminal trailer, deletes bare orphans, and returns per-session
/// recovery material. Uploaded segments are not returned.
pub fn list_recoverable(root: &Path) -> Vec<RecoveredSession> {
    let pending = root.join(PENDING_DIR);
    let entries = match fs::read_dir(&pending) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(), // nothing persisted yet
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let session_id: SessionId = match entry.file_name().to_string_lossy().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!("unrecognized directory in pending store: {}", dir.display());
                continue;
            }
        };
        match recover_session_dir(&dir, session_id) {
            Ok(recovered) => sessions.push(recovered),
            Err(e) => warn!("recovery failed for {}: {}", dir.display(), e),
        }
    }
    sessions.sort_by_key(|s| s.meta.as_ref().map(|m| m.started_at_ms).unwrap_or(0));
    sessions
}

fn recover_session_dir(dir: &Path, session_id: SessionId) -> io::Result<RecoveredSession> {
    // Latest state per seq from the index log.
    let mut commits: BTreeMap<u32, (u64, u64, u32)> = BTreeMap::new();
    let mut states: BTreeMap<u32, (UploadState, u32)> = BTreeMap::new();
    if let Ok(log) = fs::read_to_string(dir.join(INDEX_FILE)) {
        for line in log.lines() {
            match serde_json::from_str::<IndexRecord>(line) {
                Ok(IndexRecord::Commit {
                    seq,
                    start_ts,
                    end_ts,
                    frame_count,
                }) => {
                    commits.insert(seq, (start_ts, end_ts, frame_count));
                }
                Ok(IndexRecord::Status {
                    seq,
                    state,
                    attempts,
                }) => {
                    states.insert(seq, (state, attempts));
                }
                Err(e) => {
                    // A torn final line is expected after a crash mid-append.
                    debug!("skipping malformed index line in {}: {}", dir.display(), e);
                }
            }
        }
    }

    // Sweep .writing files: promote sealed ones, delete bare orphans.
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".writing") {
            continue;
        }
        match read_sealed_writing(&path) {
            Some((seq, start_ts, end_ts, frame_count)) => {
                let final_path = dir.join(segment_file_name(seq, true));
                fs::rename(&path, &final_path)?;
                commits.entry(seq).or_insert((start_ts, end_ts, frame_count));
                debug!("recovered sealed segment {} from {}", seq, name);
            }
            None => {
                warn!("deleting unsealed segment orphan {}", path.display());
                fs::remove_file(&path)?;
            }
        }
    }

    let mut segments = Vec::new();
    for (seq, (start_ts, end_ts, frame_count)) in &commits {
        let (state, attempts) = states
            .get(seq)
            .copied()
            .unwrap_or((UploadState::Pending, 0));
        if state == UploadState::Uploaded {
            continue;
        }
        let path = dir.join(segment_file_name(*seq, true));
        if !path.exists() {
            continue; // file lost; index record alone is not a segment
        }
        segments.push(Segment {
            session_id,
            seq: *seq,
            start_ts: *start_ts,
            end_ts: *end_ts,
            frame_count: *frame_count,
            path,
            finalized: true,
            upload_state: if state == UploadState::Failed {
                UploadState::Failed
            } else {
                UploadState::Pending
            },
            attempts,
        });
    }

    let events = load_events(dir);
    let meta = fs::read_to_string(dir.join(META_FILE))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());
    let crash_report = fs::read_to_string(dir.join(CRASH_FILE))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());

    Ok(RecoveredSession {
        session_id,
        dir: dir.to_path_buf(),
        segments,
        events,
        meta,
        crash_report,
    })
}

/// Parse header + trailer of a `.writing` file; `Some` iff it was sealed.
fn read_sealed_writing(path: &Path) -> Option<(u32, u64, u64, u32)> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len < HEADER_LEN + TRAILER_LEN {
        return None;
    }

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header).ok()?;
    if &header[..8] != HEADER_MAGIC {
        return None;
    }
    let seq = u32::from_le_bytes(header[8..12].try_into().ok()?);
    let start_ts = u64::from_le_bytes(header[12..20].try_into().ok()?);

    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).ok()?;
    file.read_exact(&mut trailer).ok()?;
    if &trailer[..8] != TRAILER_MAGIC {
        return None;
    }
    let end_ts = u64::from_le_bytes(trailer[8..16].try_into().ok()?);
    let frame_count = u32::from_le_bytes(trailer[16..20].try_into().ok()?);
    Some((seq, start_ts, end_ts, frame_count))
}

/// Load the persisted event buffer from a session directory.
pub fn load_events(dir: &Path) -> Vec<SessionEvent> {
    let Ok(content) = fs::read_to_string(dir.join(EVENTS_FILE)) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Remove a fully-drained session directory.
pub fn purge_session(root: &Path, session_id: SessionId) -> io::Result<()> {
    let dir = session_dir(root, session_id);
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

/// Delete a shipped crash report so it is uploaded at most once.
pub fn remove_crash_report(dir: &Path) {
    let _ = fs::remove_file(dir.join(CRASH_FILE));
}
