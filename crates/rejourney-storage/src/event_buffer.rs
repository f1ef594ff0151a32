// rejourney — session replay for mobile apps
// https://rejourney.co

//! Ordered in-memory event buffer, drained by the uploader and persisted
//! to `events.jsonl` on background transitions.

use rejourney_core::{EventData, SessionEvent};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Typing bursts arriving within this window coalesce into one event.
pub const TYPING_COALESCE_WINDOW_MS: u64 = 250;

/// Append-only FIFO of discrete events. Single-owner; the controller
/// serializes access between the observation layer and the uploader.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<SessionEvent>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in insertion order. Consecutive `KeyboardTyping` events
    /// within the coalescing window merge into the previous one by
    /// incrementing its key-press count.
    pub fn append(&mut self, event: SessionEvent) {
        if let EventData::KeyboardTyping { key_press_count } = event.data {
            if let Some(last) = self.events.last_mut() {
                if let EventData::KeyboardTyping {
                    key_press_count: last_count,
                } = &mut last.data
                {
                    if event.timestamp.saturating_sub(last.timestamp) < TYPING_COALESCE_WINDOW_MS {
                        *last_count += key_press_count;
                        return;
                    }
                }
            }
        }
        self.events.push(event);
    }

    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.events.clone()
    }

    /// Remove exactly the first `n` events — called only by the uploader
    /// after a confirmed batch acceptance.
    pub fn drop_prefix(&mut self, n: usize) {
        self.events.drain(..n.min(self.events.len()));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Persist the whole buffer as JSON lines (background-entry snapshot).
    pub fn persist_to_disk(&self, path: &Path) -> io::Result<()> {
        let mut out = Vec::new();
        for event in &self.events {
            serde_json::to_writer(&mut out, event).map_err(io::Error::other)?;
            out.push(b'\n');
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&out)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
    }

    /// Restore a persisted buffer; malformed lines (torn tail after a
    /// crash) are skipped.
    pub fn restore_from_disk(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let events = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        Ok(Self { events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rejourney_core::GestureKind;
    use tempfile::TempDir;

    fn gesture(ts: u64) -> SessionEvent {
        SessionEvent::new(
            ts,
            EventData::Gesture {
                kind: GestureKind::Tap,
                target_label: None,
            },
        )
    }

    fn typing(ts: u64, count: u32) -> SessionEvent {
        SessionEvent::new(
            ts,
            EventData::KeyboardTyping {
                key_press_count: count,
            },
        )
    }

    #[test]
    fn test_fifo_order() {
        let mut buf = EventBuffer::new();
        for ts in 0..10 {
            buf.append(gesture(ts));
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 10);
        for (i, ev) in snap.iter().enumerate() {
            assert_eq!(ev.timestamp, i as u64);
        }
    }

    #[test]
    fn test_drop_prefix_exact() {
        let mut buf = EventBuffer::new();
        for ts in 0..10 {
            buf.append(gesture(ts));
        }
        buf.drop_prefix(4);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.snapshot()[0].timestamp, 4);

        // Oversized n clamps to the buffer length.
        buf.drop_prefix(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_typing_coalesced_within_window() {
        let mut buf = EventBuffer::new();
        buf.append(typing(1000, 1));
        buf.append(typing(1100, 2));
        buf.append(typing(1200, 1));
        assert_eq!(buf.len(), 1);
        match buf.snapshot()[0].data {
            EventData::KeyboardTyping { key_press_count } => assert_eq!(key_press_count, 4),
            _ => panic!("expected typing event"),
        }
    }

    #[test]
    fn test_typing_not_coalesced_after_window() {
        let mut buf = EventBuffer::new();
        buf.append(typing(1000, 1));
        buf.append(typing(1250, 1)); // exactly at the window boundary
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_typing_not_coalesced_across_other_events() {
        let mut buf = EventBuffer::new();
        buf.append(typing(1000, 1));
        buf.append(gesture(1050));
        buf.append(typing(1100, 1));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_persist_restore_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");

        let mut buf = EventBuffer::new();
        buf.append(gesture(1));
        buf.append(typing(2, 3));
        buf.append(SessionEvent::new(3, EventData::AppBackground));
        buf.persist_to_disk(&path).unwrap();

        let restored = EventBuffer::restore_from_disk(&path).unwrap();
        assert_eq!(restored.snapshot(), buf.snapshot());
    }

    #[test]
    fn test_restore_skips_torn_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("events.jsonl");

        let mut buf = EventBuffer::new();
        buf.append(gesture(1));
        buf.persist_to_disk(&path).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"type\":\"gest").unwrap();

        let restored = EventBuffer::restore_from_disk(&path).unwrap();
        assert_eq!(restored.len(), 1);
    }
}
