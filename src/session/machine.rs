//! Resumable run state machine.
//!
//! Owns every mutation of a [`TestSession`]. Each mutation is followed by a
//! best-effort full-document write: a failed write is logged and counted,
//! never returned, and the in-memory session stays authoritative.

use chrono::Utc;
use std::sync::Arc;

use crate::error::{RegressError, RegressResult};
use crate::session::store::{SnapshotStore, generate_session_id};
use crate::session::types::{
    ErrorEntry, RunStatus, RunSummary, TargetDescriptor, TargetRecord, TargetResult, TargetStatus,
    TestSession,
};

const LOG_TARGET: &str = "menu_regress::session";

pub struct SessionStateMachine {
    session: TestSession,
    store: Arc<dyn SnapshotStore>,
    initialized: bool,
    persist_failures: usize,
}

impl SessionStateMachine {
    /// New session with a generated id
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_id(store, generate_session_id())
    }

    pub fn with_id(store: Arc<dyn SnapshotStore>, session_id: impl Into<String>) -> Self {
        Self {
            session: TestSession::new(session_id),
            store,
            initialized: false,
            persist_failures: 0,
        }
    }

    pub fn session(&self) -> &TestSession {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Writes that failed since this machine was created
    pub fn persist_failures(&self) -> usize {
        self.persist_failures
    }

    /// Create one pending record per descriptor and start the run.
    ///
    /// Duplicate ids keep their first occurrence.
    pub fn initialize(&mut self, targets: &[TargetDescriptor]) -> RegressResult<()> {
        if self.initialized || self.session.status != RunStatus::Initializing {
            return Err(RegressError::SessionCorrupt(format!(
                "session {} already initialized",
                self.session.session_id
            )));
        }

        let mut records: Vec<TargetRecord> = Vec::with_capacity(targets.len());
        for descriptor in targets {
            if records.iter().any(|r| r.id == descriptor.id) {
                tracing::warn!(target: LOG_TARGET, id = %descriptor.id, "duplicate target id ignored");
                continue;
            }
            records.push(TargetRecord::from_descriptor(descriptor));
        }

        self.session.total_menus = records.len();
        self.session.menus = records;
        self.session.rebuild_index();
        self.session.status = RunStatus::Running;
        self.session.current_step = "running".to_string();
        self.initialized = true;

        tracing::info!(
            target: LOG_TARGET,
            session = %self.session.session_id,
            total = self.session.total_menus,
            "session initialized"
        );
        self.persist();
        Ok(())
    }

    /// Free-form progress label
    pub fn set_step(&mut self, step: impl Into<String>) {
        self.session.current_step = step.into();
        self.persist();
    }

    /// Mark a target running. Unknown ids are logged and ignored.
    pub fn start_target(&mut self, id: &str) -> RegressResult<()> {
        self.ensure_open()?;
        let Some(record) = self.session.target_mut(id) else {
            tracing::warn!(target: LOG_TARGET, id, "start requested for unknown target");
            return Ok(());
        };
        check_transition(record, TargetStatus::Running)?;

        record.status = TargetStatus::Running;
        record.attempts += 1;
        record.start_time = Some(Utc::now());
        record.end_time = None;
        record.duration = None;
        tracing::debug!(target: LOG_TARGET, id, attempt = record.attempts, "target started");

        self.session.current_step = format!("testing {}", id);
        self.persist();
        Ok(())
    }

    /// Record the final outcome of a target
    pub fn complete_target(&mut self, id: &str, result: TargetResult) -> RegressResult<()> {
        self.ensure_open()?;
        let next = if result.success {
            TargetStatus::Completed
        } else {
            TargetStatus::Failed
        };

        let Some(record) = self.session.target_mut(id) else {
            tracing::warn!(target: LOG_TARGET, id, "completion reported for unknown target");
            return Ok(());
        };
        check_transition(record, next)?;

        let now = Utc::now();
        record.status = next;
        record.end_time = Some(now);
        record.duration = record.start_time.map(|start| (now - start).num_milliseconds());
        record.error = result.error.clone();
        if result.screenshot_ref.is_some() {
            record.screenshot_ref = result.screenshot_ref.clone();
        }
        let attempt = record.attempts;

        if result.success {
            self.session.completed_menus += 1;
        } else {
            self.session.failed_menus += 1;
            let message = result.error.unwrap_or_else(|| "unknown error".to_string());
            tracing::warn!(target: LOG_TARGET, id, attempt, error = %message, "target failed");
            self.session.errors.push(ErrorEntry {
                target_id: id.to_string(),
                message,
                timestamp: now,
                attempt,
            });
        }

        self.persist();
        Ok(())
    }

    pub fn skip_target(&mut self, id: &str, reason: &str) -> RegressResult<()> {
        self.ensure_open()?;
        let Some(record) = self.session.target_mut(id) else {
            tracing::warn!(target: LOG_TARGET, id, "skip requested for unknown target");
            return Ok(());
        };
        check_transition(record, TargetStatus::Skipped)?;

        record.status = TargetStatus::Skipped;
        record.skip_reason = Some(reason.to_string());
        record.end_time = Some(Utc::now());
        self.session.skipped_menus += 1;
        tracing::info!(target: LOG_TARGET, id, reason, "target skipped");

        self.persist();
        Ok(())
    }

    /// Counts so far, with a caller-supplied message
    pub fn summary(&self, message: impl Into<String>) -> RunSummary {
        RunSummary {
            total: self.session.total_menus,
            completed: self.session.completed_menus,
            failed: self.session.failed_menus,
            skipped: self.session.skipped_menus,
            message: message.into(),
        }
    }

    /// Terminal transition: the run finished
    pub fn complete(&mut self, summary: RunSummary) -> RegressResult<()> {
        self.finish(RunStatus::Completed)?;
        tracing::info!(
            target: LOG_TARGET,
            session = %self.session.session_id,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "{}",
            summary.message
        );
        self.session.current_step = "completed".to_string();
        self.session.summary = Some(summary);
        self.persist();
        Ok(())
    }

    /// Terminal transition: the run was aborted
    pub fn fail(&mut self, error: &str) -> RegressResult<()> {
        self.finish(RunStatus::Failed)?;
        tracing::error!(target: LOG_TARGET, session = %self.session.session_id, error, "session failed");
        self.session.current_step = "failed".to_string();
        self.session.failure = Some(error.to_string());
        self.session.summary = Some(self.summary(error));
        self.persist();
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> RegressResult<()> {
        if self.session.status.is_terminal() {
            return Err(RegressError::IllegalTransition {
                id: self.session.session_id.clone(),
                from: self.session.status.to_string(),
                to: status.to_string(),
            });
        }
        let now = Utc::now();
        self.session.status = status;
        self.session.timestamps.completed = Some(now);
        self.session.duration = Some((now - self.session.start_time).num_milliseconds());
        Ok(())
    }

    fn ensure_open(&self) -> RegressResult<()> {
        if self.session.status.is_terminal() {
            return Err(RegressError::IllegalTransition {
                id: self.session.session_id.clone(),
                from: self.session.status.to_string(),
                to: "target update".to_string(),
            });
        }
        Ok(())
    }

    /// Best-effort write of the whole document
    fn persist(&mut self) {
        self.session.timestamps.updated = Utc::now();
        if let Err(e) = self.store.save(&self.session) {
            self.persist_failures += 1;
            tracing::warn!(
                target: LOG_TARGET,
                session = %self.session.session_id,
                error = %e,
                "snapshot write failed, continuing with in-memory state"
            );
        }
    }

    /// Read a stored snapshot for resuming.
    ///
    /// Fails with `SessionCorrupt` when the payload is missing, lacks
    /// `sessionId` or `menus`, or does not decode.
    pub fn load_for_resume(store: &dyn SnapshotStore, session_id: &str) -> RegressResult<TestSession> {
        let payload = store.load(session_id).map_err(|e| {
            RegressError::SessionCorrupt(format!("cannot read snapshot {}: {}", session_id, e))
        })?;

        let has_id = payload.get("sessionId").and_then(|v| v.as_str()).is_some();
        let has_targets = payload
            .get("menus")
            .map(|v| v.is_array() || v.is_object())
            .unwrap_or(false);
        if !has_id || !has_targets {
            return Err(RegressError::SessionCorrupt(format!(
                "snapshot {} is missing sessionId or menus",
                session_id
            )));
        }

        let mut session: TestSession = serde_json::from_value(payload).map_err(|e| {
            RegressError::SessionCorrupt(format!("snapshot {} does not decode: {}", session_id, e))
        })?;
        session.rebuild_index();
        Ok(session)
    }

    /// Targets to run again after a crash.
    ///
    /// `running` counts as interrupted. Each record comes back as a pending
    /// descriptor that keeps its stored attempt count.
    pub fn resumable_targets(snapshot: &TestSession) -> Vec<TargetDescriptor> {
        snapshot
            .menus
            .iter()
            .filter(|r| r.status.is_resumable())
            .map(TargetRecord::to_descriptor)
            .collect()
    }

    /// Close a crashed session whose targets a new run has taken over, so
    /// it is no longer offered for resume. Fails like `load_for_resume` on
    /// a bad snapshot, and with `IllegalTransition` if it already finished.
    pub fn mark_resumed(
        store: Arc<dyn SnapshotStore>,
        session_id: &str,
        resumed_by: &str,
    ) -> RegressResult<()> {
        let session = Self::load_for_resume(store.as_ref(), session_id)?;
        let mut machine = Self {
            session,
            store,
            initialized: true,
            persist_failures: 0,
        };
        machine.fail(&format!("resumed as {}", resumed_by))
    }
}

fn check_transition(record: &TargetRecord, next: TargetStatus) -> RegressResult<()> {
    if record.status.can_transition_to(next) {
        return Ok(());
    }
    tracing::warn!(
        target: LOG_TARGET,
        id = %record.id,
        from = %record.status,
        to = %next,
        "rejected backward status transition"
    );
    Err(RegressError::IllegalTransition {
        id: record.id.clone(),
        from: record.status.to_string(),
        to: next.to_string(),
    })
}
