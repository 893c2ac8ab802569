//! Durable storage for session snapshots.
//!
//! One JSON document per run (`{dir}/{session_id}.json`), always replaced
//! whole: the new document is written to a temporary file in the same
//! directory and renamed over the old one.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::{RegressError, RegressResult};
use crate::session::types::{RunStatus, TestSession};

/// Where snapshots are written and read back
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored document for `session.session_id`
    fn save(&self, session: &TestSession) -> RegressResult<()>;

    /// Raw stored payload; validation is left to the caller
    fn load(&self, session_id: &str) -> RegressResult<serde_json::Value>;

    /// Stored sessions, newest first
    fn list(&self) -> RegressResult<Vec<SessionInfo>>;
}

/// Listing entry for a stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub total_menus: usize,
    pub completed_menus: usize,
    pub failed_menus: usize,
    pub skipped_menus: usize,
}

impl From<&TestSession> for SessionInfo {
    fn from(session: &TestSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            start_time: session.start_time,
            total_menus: session.total_menus,
            completed_menus: session.completed_menus,
            failed_menus: session.failed_menus,
            skipped_menus: session.skipped_menus,
        }
    }
}

/// File-backed snapshot store
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_id(session_id)))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, session: &TestSession) -> RegressResult<()> {
        let payload = serde_json::to_vec_pretty(session)?;
        replace_file(&self.path_for(&session.session_id), &payload)
    }

    fn load(&self, session_id: &str) -> RegressResult<serde_json::Value> {
        let data = fs::read(self.path_for(session_id))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn list(&self) -> RegressResult<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        if !self.dir.exists() {
            return Ok(sessions);
        }

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            // Unreadable documents are skipped; they surface on explicit load
            let info = fs::read(&path)
                .ok()
                .and_then(|data| serde_json::from_slice::<SessionInfo>(&data).ok());
            if let Some(info) = info {
                sessions.push(info);
            }
        }

        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }
}

/// In-memory store; writes can be made to fail on demand
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    documents: Mutex<HashMap<String, String>>,
    fail_writes: Mutex<bool>,
    writes: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    /// Store a raw document, e.g. a hand-written or damaged snapshot
    pub fn insert_raw(&self, session_id: &str, payload: &str) {
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(session_id.to_string(), payload.to_string());
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, session: &TestSession) -> RegressResult<()> {
        if self.fail_writes.lock().map(|f| *f).unwrap_or(false) {
            return Err(RegressError::Persistence("simulated write failure".to_string()));
        }
        let payload = serde_json::to_string(session)?;
        self.documents
            .lock()
            .map_err(|e| RegressError::Persistence(e.to_string()))?
            .insert(session.session_id.clone(), payload);
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }

    fn load(&self, session_id: &str) -> RegressResult<serde_json::Value> {
        let docs = self
            .documents
            .lock()
            .map_err(|e| RegressError::Persistence(e.to_string()))?;
        let payload = docs.get(session_id).ok_or_else(|| {
            RegressError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no snapshot for session {}", session_id),
            ))
        })?;
        Ok(serde_json::from_str(payload)?)
    }

    fn list(&self) -> RegressResult<Vec<SessionInfo>> {
        let docs = self
            .documents
            .lock()
            .map_err(|e| RegressError::Persistence(e.to_string()))?;
        let mut sessions: Vec<SessionInfo> = docs
            .values()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect();
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(sessions)
    }
}

/// Newest stored session that has not reached a terminal status
pub fn latest_resumable(store: &dyn SnapshotStore) -> RegressResult<Option<SessionInfo>> {
    Ok(store
        .list()?
        .into_iter()
        .find(|info| !info.status.is_terminal()))
}

/// Generate a unique session ID: `session_{unix_ms}_{random}`
pub fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("session_{}_{}", timestamp, suffix)
}

/// Replace `path` with `payload` through a temporary file in the same
/// directory, so readers see either the old or the new document.
///
/// On a multi-threaded tokio runtime the blocking I/O runs via
/// `block_in_place`, leaving the worker's other tasks free to move.
pub(crate) fn replace_file(path: &Path, payload: &[u8]) -> RegressResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    off_worker(|| {
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(payload)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| RegressError::Persistence(e.to_string()))?;
        Ok(())
    })
}

fn off_worker<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(io)
        }
        // current_thread runtimes cannot block in place; outside a runtime there is nothing to protect
        _ => io(),
    }
}

/// Keep session ids usable as file names
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Delete snapshot files older than `max_age`
pub fn cleanup_old_sessions(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut cleaned = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if let Ok(age) = now.duration_since(modified) {
                    if age > max_age && fs::remove_file(&path).is_ok() {
                        cleaned += 1;
                    }
                }
            }
        }
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_session_id_shape() {
        let id = generate_session_id();
        assert!(id.starts_with("session_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("session_1_abc"), "session_1_abc");
        assert_eq!(sanitize_id("../etc/passwd"), "___etc_passwd");
    }

    #[test]
    fn test_file_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        let mut session = TestSession::new("session_1_aaaaaa");
        session.status = RunStatus::Running;
        store.save(&session).unwrap();
        session.current_step = "rewritten".to_string();
        store.save(&session).unwrap();

        let value = store.load("session_1_aaaaaa").unwrap();
        assert_eq!(value["currentStep"], "rewritten");
        assert_eq!(value["status"], "running");

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "session_1_aaaaaa");

        let resumable = latest_resumable(&store).unwrap().unwrap();
        assert_eq!(resumable.session_id, "session_1_aaaaaa");
    }

    #[test]
    fn test_memory_store_failures() {
        let store = MemorySnapshotStore::new();
        let session = TestSession::new("s");
        store.fail_writes(true);
        assert!(matches!(store.save(&session), Err(RegressError::Persistence(_))));
        store.fail_writes(false);
        store.save(&session).unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.load("missing").is_err());
    }

    #[test]
    fn test_cleanup_old_sessions_keeps_recent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        let cleaned = cleanup_old_sessions(dir.path(), Duration::from_secs(3600)).unwrap();
        assert_eq!(cleaned, 0);
        assert!(dir.path().join("a.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_store_saves_from_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("nested"));
        let session = TestSession::new("session_2_bbbbbb");

        // Another task keeps running while the write blocks in place
        let ticker = tokio::spawn(async { tokio::task::yield_now().await });
        store.save(&session).unwrap();
        ticker.await.unwrap();

        assert_eq!(store.load("session_2_bbbbbb").unwrap()["sessionId"], "session_2_bbbbbb");
        let leftovers = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_file_store_saves_from_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        store.save(&TestSession::new("s")).unwrap();
        assert!(store.path_for("s").is_file());
    }
}
