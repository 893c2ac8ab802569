//! Persisted, resumable record of one regression run.
//!
//! - [`types`]: the session document and its per-target records
//! - [`store`]: where snapshots live (file-backed by default)
//! - [`machine`]: the only code allowed to mutate a session

pub mod machine;
pub mod store;
pub mod types;

use std::path::Path;

pub use machine::SessionStateMachine;
pub use store::{
    FileSnapshotStore, MemorySnapshotStore, SessionInfo, SnapshotStore, cleanup_old_sessions,
    generate_session_id, latest_resumable,
};
pub use types::{
    ErrorEntry, RunStatus, RunSummary, TargetDescriptor, TargetRecord, TargetResult, TargetStatus,
    TestSession, Timestamps,
};

use crate::error::RegressResult;

/// List sessions stored under `dir`, newest first
pub fn list_sessions(dir: &Path) -> RegressResult<Vec<SessionInfo>> {
    FileSnapshotStore::new(dir).list()
}
