//! Integration tests for crash recovery of session snapshots

use std::fs;
use std::sync::Arc;

use menu_regress::RegressError;
use menu_regress::session::{
    FileSnapshotStore, RunStatus, SessionStateMachine, TargetDescriptor, TargetResult, TargetStatus,
    latest_resumable, list_sessions,
};

fn five_targets() -> Vec<TargetDescriptor> {
    (1..=5)
        .map(|i| {
            TargetDescriptor::new(format!("menu-{}", i), format!("Menu {}", i))
                .url(format!("https://app.test/m{}", i))
        })
        .collect()
}

#[test]
fn test_resume_after_crash_mid_target() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(FileSnapshotStore::new(dir.path()));

    let session_id = {
        let mut machine = SessionStateMachine::new(store.clone());
        machine.initialize(&five_targets()).unwrap();
        for id in ["menu-1", "menu-2"] {
            machine.start_target(id).unwrap();
            machine.complete_target(id, TargetResult::passed()).unwrap();
        }
        machine.start_target("menu-3").unwrap();
        // Process dies here: no completion for menu-3
        machine.session_id().to_string()
    };

    let info = latest_resumable(store.as_ref()).unwrap().expect("No resumable session");
    assert_eq!(info.session_id, session_id);
    assert_eq!(info.status, RunStatus::Running);

    let snapshot = SessionStateMachine::load_for_resume(store.as_ref(), &session_id).unwrap();
    assert_eq!(snapshot.completed_menus, 2);

    let resumable = SessionStateMachine::resumable_targets(&snapshot);
    let ids: Vec<&str> = resumable.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["menu-3", "menu-4", "menu-5"]);
    let attempts: Vec<u32> = resumable.iter().map(|t| t.attempts).collect();
    assert_eq!(attempts, vec![1, 0, 0]);
    assert_eq!(resumable[0].url.as_deref(), Some("https://app.test/m3"));

    // The resumed run starts every target pending again
    let mut next = SessionStateMachine::new(store.clone());
    next.initialize(&resumable).unwrap();
    assert!(next
        .session()
        .menus
        .iter()
        .all(|r| r.status == TargetStatus::Pending));
    next.start_target("menu-3").unwrap();
    assert_eq!(next.session().target("menu-3").unwrap().attempts, 2);
}

#[test]
fn test_finished_sessions_are_not_resumable() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(FileSnapshotStore::new(dir.path()));

    let mut machine = SessionStateMachine::new(store.clone());
    machine.initialize(&five_targets()[..1]).unwrap();
    machine.start_target("menu-1").unwrap();
    machine
        .complete_target("menu-1", TargetResult::failed("page is blank"))
        .unwrap();
    let summary = machine.summary("done");
    machine.complete(summary).unwrap();

    assert!(latest_resumable(store.as_ref()).unwrap().is_none());

    let listed = list_sessions(dir.path()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, RunStatus::Completed);
    assert_eq!(listed[0].failed_menus, 1);
}

#[test]
fn test_snapshot_layout() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(FileSnapshotStore::new(dir.path()));
    let mut machine = SessionStateMachine::new(store.clone());
    machine.initialize(&five_targets()[..2]).unwrap();

    let path = store.path_for(machine.session_id());
    let raw: serde_json::Value =
        serde_json::from_slice(&fs::read(&path).expect("Snapshot not written")).unwrap();

    for field in [
        "sessionId",
        "startTime",
        "status",
        "currentStep",
        "totalMenus",
        "completedMenus",
        "failedMenus",
        "skippedMenus",
        "menus",
        "errors",
        "timestamps",
    ] {
        assert!(raw.get(field).is_some(), "missing field {}", field);
    }
    assert_eq!(raw["menus"][0]["id"], "menu-1");
    assert_eq!(raw["menus"][1]["status"], "pending");

    // No temporary files are left next to the snapshot
    let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[test]
fn test_corrupt_snapshot_fails_resume_only() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    fs::write(dir.path().join("session_bad.json"), "{\"menus\": []}").unwrap();
    fs::write(dir.path().join("session_worse.json"), "not json").unwrap();
    let store = FileSnapshotStore::new(dir.path());

    for id in ["session_bad", "session_worse", "session_missing"] {
        assert!(matches!(
            SessionStateMachine::load_for_resume(&store, id),
            Err(RegressError::SessionCorrupt(_))
        ));
    }

    // A fresh run in the same directory is unaffected
    let mut machine = SessionStateMachine::new(Arc::new(store));
    assert!(machine.initialize(&five_targets()).is_ok());
}
