// rejourney — session replay for mobile apps
// https://rejourney.co

//! Durable key-value seam for the handful of process-wide keys the core
//! persists (the active session id, so crash reports from the previous
//! boot attach to the right session). The host app may substitute the
//! platform's own store behind the trait.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Key holding the active session id across boots.
pub const CURRENT_SESSION_KEY: &str = "current_session_id";

pub trait DurableKv: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// File-backed implementation: one JSON object, rewritten atomically on
/// every mutation. The key set is tiny, so this stays cheap.
pub struct FileKv {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileKv {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let map = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn flush(&self, map: &HashMap<String, String>) {
        let write = || -> io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_vec(map).map_err(io::Error::other)?;
            let tmp = self.path.with_extension("tmp");
            {
                let mut file = fs::File::create(&tmp)?;
                file.write_all(&json)?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            warn!("durable kv flush failed: {}", e);
        }
    }
}

impl DurableKv for FileKv {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_string(), value.to_string());
            self.flush(&map);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(key);
            self.flush(&map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_remove() {
        let tmp = TempDir::new().unwrap();
        let kv = FileKv::open(tmp.path().join("state.json")).unwrap();
        assert_eq!(kv.get(CURRENT_SESSION_KEY), None);

        kv.set(CURRENT_SESSION_KEY, "abc");
        assert_eq!(kv.get(CURRENT_SESSION_KEY).as_deref(), Some("abc"));

        kv.remove(CURRENT_SESSION_KEY);
        assert_eq!(kv.get(CURRENT_SESSION_KEY), None);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        {
            let kv = FileKv::open(path.clone()).unwrap();
            kv.set(CURRENT_SESSION_KEY, "persisted");
        }
        let kv = FileKv::open(path).unwrap();
        assert_eq!(kv.get(CURRENT_SESSION_KEY).as_deref(), Some("persisted"));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, b"not json").unwrap();
        let kv = FileKv::open(path).unwrap();
        assert_eq!(kv.get("anything"), None);
    }
}
