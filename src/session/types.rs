//! Persisted record of one test run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Initializing => "initializing",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one target. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TargetStatus {
    fn rank(self) -> u8 {
        match self {
            TargetStatus::Pending => 0,
            TargetStatus::Running => 1,
            TargetStatus::Completed | TargetStatus::Failed | TargetStatus::Skipped => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Interrupted or never started
    pub fn is_resumable(self) -> bool {
        matches!(self, TargetStatus::Pending | TargetStatus::Running)
    }

    /// Forward-only check. `running -> running` is a restart and allowed;
    /// nothing leaves a terminal status.
    pub fn can_transition_to(self, next: TargetStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (TargetStatus::Running, TargetStatus::Running) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Running => "running",
            TargetStatus::Completed => "completed",
            TargetStatus::Failed => "failed",
            TargetStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Input describing one target to test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    pub id: String,
    pub display_text: String,
    /// Hierarchy depth, 1 for top-level entries
    #[serde(default = "default_level")]
    pub level: u32,
    /// Route of the target, when known
    #[serde(default)]
    pub url: Option<String>,
    /// Start events already spent on this target by earlier runs
    #[serde(default)]
    pub attempts: u32,
}

fn default_level() -> u32 {
    1
}

impl TargetDescriptor {
    pub fn new(id: impl Into<String>, display_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_text: display_text.into(),
            level: 1,
            url: None,
            attempts: 0,
        }
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = level.max(1);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Per-target state inside a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub id: String,
    pub display_text: String,
    pub level: u32,
    #[serde(default)]
    pub url: Option<String>,
    pub status: TargetStatus,
    /// Number of start events
    pub attempts: u32,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between the last start and the end
    pub duration: Option<i64>,
    pub screenshot_ref: Option<String>,
}

impl TargetRecord {
    pub fn from_descriptor(descriptor: &TargetDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            display_text: descriptor.display_text.clone(),
            level: descriptor.level.max(1),
            url: descriptor.url.clone(),
            status: TargetStatus::Pending,
            attempts: descriptor.attempts,
            error: None,
            skip_reason: None,
            start_time: None,
            end_time: None,
            duration: None,
            screenshot_ref: None,
        }
    }

    /// Fresh descriptor for a later run, keeping the attempt count
    pub fn to_descriptor(&self) -> TargetDescriptor {
        TargetDescriptor {
            id: self.id.clone(),
            display_text: self.display_text.clone(),
            level: self.level,
            url: self.url.clone(),
            attempts: self.attempts,
        }
    }
}

/// Entry of the append-only error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub target_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

/// Outcome reported by the orchestrator for one target
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetResult {
    pub success: bool,
    pub error: Option<String>,
    pub screenshot_ref: Option<String>,
}

impl TargetResult {
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            screenshot_ref: None,
        }
    }

    pub fn with_screenshot(mut self, reference: impl Into<String>) -> Self {
        self.screenshot_ref = Some(reference.into());
        self
    }
}

/// Human-readable end-of-run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

/// The durable document for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub status: RunStatus,
    pub current_step: String,
    pub total_menus: usize,
    pub completed_menus: usize,
    pub failed_menus: usize,
    pub skipped_menus: usize,
    /// Targets in run order
    #[serde(deserialize_with = "deserialize_targets")]
    pub menus: Vec<TargetRecord>,
    pub errors: Vec<ErrorEntry>,
    pub timestamps: Timestamps,
    /// Total run time in milliseconds, set on the terminal transition
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub summary: Option<RunSummary>,
    #[serde(default)]
    pub failure: Option<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl TestSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            start_time: now,
            status: RunStatus::Initializing,
            current_step: "initializing".to_string(),
            total_menus: 0,
            completed_menus: 0,
            failed_menus: 0,
            skipped_menus: 0,
            menus: Vec::new(),
            errors: Vec::new(),
            timestamps: Timestamps {
                started: now,
                updated: now,
                completed: None,
            },
            duration: None,
            summary: None,
            failure: None,
            index: HashMap::new(),
        }
    }

    pub fn target(&self, id: &str) -> Option<&TargetRecord> {
        self.position(id).map(|i| &self.menus[i])
    }

    pub(crate) fn target_mut(&mut self, id: &str) -> Option<&mut TargetRecord> {
        self.position(id).map(move |i| &mut self.menus[i])
    }

    fn position(&self, id: &str) -> Option<usize> {
        match self.index.get(id) {
            Some(&i) if self.menus.get(i).map(|r| r.id == id).unwrap_or(false) => Some(i),
            _ => self.menus.iter().position(|r| r.id == id),
        }
    }

    /// Rebuild the id lookup after the target list changed or was loaded
    pub(crate) fn rebuild_index(&mut self) {
        self.index = self
            .menus
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
    }

    /// Targets whose status has reached completed, failed or skipped
    pub fn finished_count(&self) -> usize {
        self.completed_menus + self.failed_menus + self.skipped_menus
    }
}

/// `menus` is written as an ordered array; the keyed-object form is still
/// accepted and ordered by key.
fn deserialize_targets<'de, D>(deserializer: D) -> Result<Vec<TargetRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PersistedTargets {
        Ordered(Vec<TargetRecord>),
        Keyed(BTreeMap<String, TargetRecord>),
    }

    Ok(match PersistedTargets::deserialize(deserializer)? {
        PersistedTargets::Ordered(list) => list,
        PersistedTargets::Keyed(map) => map.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_forward_only() {
        use TargetStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Completed, Failed, Skipped] {
            for next in [Pending, Running, Completed, Failed, Skipped] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_descriptor_defaults_when_deserializing() {
        let d: TargetDescriptor =
            serde_json::from_str(r#"{"id":"m1","displayText":"Reports"}"#).unwrap();
        assert_eq!(d.level, 1);
        assert_eq!(d.attempts, 0);
        assert!(d.url.is_none());
    }

    #[test]
    fn test_menus_accepts_keyed_object_form() {
        let mut session = TestSession::new("s1");
        session.menus = vec![
            TargetRecord::from_descriptor(&TargetDescriptor::new("b", "B")),
            TargetRecord::from_descriptor(&TargetDescriptor::new("a", "A")),
        ];
        let mut value = serde_json::to_value(&session).unwrap();
        assert!(value["menus"].is_array());
        assert_eq!(value["menus"][0]["id"], "b");

        let keyed: serde_json::Map<String, serde_json::Value> = value["menus"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| (r["id"].as_str().unwrap().to_string(), r.clone()))
            .collect();
        value["menus"] = serde_json::Value::Object(keyed);

        let loaded: TestSession = serde_json::from_value(value).unwrap();
        let ids: Vec<&str> = loaded.menus.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
