//! Integration tests driving full runs against the scripted browser

use std::sync::Arc;

use menu_regress::cache::RouteCacheStore;
use menu_regress::capability::{Capability, MockBrowser, MockPage, prompts};
use menu_regress::config::Config;
use menu_regress::navigation::BoundaryPolicy;
use menu_regress::regression::{Bitmap, ComparisonOutcome, EngineConfig, RegressionEngine};
use menu_regress::retry::{RetryClassifier, RetryPolicy};
use menu_regress::runner::{RunOptions, Runner};
use menu_regress::session::{
    MemorySnapshotStore, RunStatus, SessionStateMachine, SnapshotStore, TargetDescriptor, TargetStatus,
    latest_resumable,
};

const HOME: &str = "https://app.test/";

fn site() -> Arc<MockBrowser> {
    let menu = [
        ("Reports", "https://app.test/reports"),
        ("Users", "https://app.test/users"),
        ("Docs", "https://docs.vendor.net/"),
        ("Audit", "https://app.test/audit"),
    ];
    let pages = [
        (HOME, MockPage::new()),
        ("https://app.test/reports", MockPage::new().color([200, 220, 255, 255])),
        ("https://app.test/users", MockPage::new().overlay()),
        ("https://app.test/audit", MockPage::new().blank()),
        ("https://docs.vendor.net/", MockPage::new()),
    ];

    let mut browser = MockBrowser::new().with_viewport(48, 32);
    for (url, page) in pages {
        let page = menu
            .iter()
            .fold(page, |p, (text, target)| p.link(prompts::menu_entry(text), *target));
        browser = browser.page(url, page);
    }
    Arc::new(browser.start_at(HOME))
}

fn runner(
    browser: &Arc<MockBrowser>,
    store: &Arc<MemorySnapshotStore>,
    dir: &std::path::Path,
) -> Runner {
    Runner::new(
        browser.clone(),
        store.clone(),
        &Config::defaults(),
        RunOptions::new(HOME).overflow_label("More"),
    )
    .with_retry(RetryClassifier::new(browser.clone(), RetryPolicy::immediate()))
    .with_boundary(BoundaryPolicy::new(["app.test"]))
    .with_engine(Some(RegressionEngine::new(EngineConfig::in_dir(dir))))
}

fn targets() -> Vec<TargetDescriptor> {
    vec![
        TargetDescriptor::new("reports", "Reports"),
        TargetDescriptor::new("users", "Users"),
        TargetDescriptor::new("docs", "Docs"),
        TargetDescriptor::new("audit", "Audit").level(2),
    ]
}

#[tokio::test]
async fn test_full_run_outcomes() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let browser = site();
    let store = Arc::new(MemorySnapshotStore::new());
    let mut runner = runner(&browser, &store, dir.path());

    let result = runner.run(&targets()).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.summary.total, 4);
    assert_eq!(result.summary.completed, 3);
    assert_eq!(result.summary.failed, 1);

    // Leaving the domain is flagged, then undone, without failing the target
    let docs = &result.targets[2];
    assert!(docs.success);
    let nav = docs.navigation.as_ref().expect("No navigation outcome");
    assert!(nav.is_cross_domain);
    assert!(nav.return_success);

    // The blank page fails validation on every attempt
    let audit = &result.targets[3];
    assert!(!audit.success);
    assert_eq!(audit.attempts_used, 3);
    assert_eq!(
        audit.error.as_deref(),
        Some("retry exhausted after 3 attempts: validation failed: page is blank")
    );

    // First run: every successful in-boundary target saved a new baseline
    for t in &result.targets[..2] {
        assert!(matches!(
            t.comparison,
            Some(ComparisonOutcome::Baseline { is_new: true, .. })
        ));
    }
    assert!(dir.path().join("baseline").join("reports.png").exists());
    // The foreign root would have claimed the app's "home" key
    assert_eq!(docs.comparison, None);
    assert!(!dir.path().join("baseline").join("home.png").exists());
    assert_eq!(browser.call_count("tap:the 'More' menu expander"), 1);
    // Users carries an overlay, dismissed before the next target's first attempt
    assert!(browser
        .calls()
        .contains(&format!("tap:{}", prompts::DISMISS_OVERLAY)));

    let stored = store.load(&result.session_id).unwrap();
    assert_eq!(stored["status"], "completed");
    assert_eq!(stored["errors"][0]["targetId"], "audit");
}

#[tokio::test]
async fn test_second_run_compares_against_baselines() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let browser = site();
    let store = Arc::new(MemorySnapshotStore::new());
    let few = &targets()[..2];

    runner(&browser, &store, dir.path()).run(few).await.unwrap();

    browser.replace_page(
        "https://app.test/reports",
        MockPage::new()
            .color([255, 0, 0, 255])
            .link(prompts::menu_entry("Users"), "https://app.test/users"),
    );
    browser.navigate(HOME).await.unwrap();
    let result = runner(&browser, &store, dir.path()).run(few).await.unwrap();

    let ComparisonOutcome::Comparison { result: diff, .. } = result.targets[0]
        .comparison
        .clone()
        .expect("No comparison")
    else {
        panic!("expected a comparison");
    };
    assert!(!diff.is_match);
    assert!(diff.diff_image.is_some());
    // Mismatches only fail targets when asked to
    assert!(result.targets[0].success);

    let ComparisonOutcome::Comparison { result: same, .. } = result.targets[1]
        .comparison
        .clone()
        .expect("No comparison")
    else {
        panic!("expected a comparison");
    };
    assert!(same.is_match);

    // Same change, but now a mismatch fails the target
    browser.navigate(HOME).await.unwrap();
    let strict = RegressionEngine::new(EngineConfig::in_dir(dir.path()).fail_on_diff(true));
    let result = runner(&browser, &store, dir.path())
        .with_engine(Some(strict))
        .run(&few[..1])
        .await
        .unwrap();
    assert!(!result.targets[0].success);
    assert_eq!(result.summary.failed, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let browser = site();
    browser.fail_next("tap", "request timeout", 1);
    let store = Arc::new(MemorySnapshotStore::new());

    let result = runner(&browser, &store, dir.path())
        .run(&targets()[..1])
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.targets[0].attempts_used, 2);
}

#[tokio::test]
async fn test_resume_runs_only_unfinished_targets() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let browser = site();
    let store = Arc::new(MemorySnapshotStore::new());

    // Simulate a crash: first target done, second started, rest untouched
    let crashed_id = {
        let mut machine = SessionStateMachine::with_id(store.clone(), "session_crashed");
        machine.initialize(&targets()).unwrap();
        machine.start_target("reports").unwrap();
        machine
            .complete_target("reports", menu_regress::TargetResult::passed())
            .unwrap();
        machine.start_target("users").unwrap();
        machine.session_id().to_string()
    };

    let snapshot = SessionStateMachine::load_for_resume(store.as_ref(), &crashed_id).unwrap();
    let remaining = SessionStateMachine::resumable_targets(&snapshot);
    assert_eq!(remaining.len(), 3);

    let result = runner(&browser, &store, dir.path())
        .resuming(crashed_id.clone())
        .run(&remaining)
        .await
        .unwrap();
    assert_eq!(result.summary.total, 3);
    assert!(result.targets.iter().all(|t| t.id != "reports"));

    let resumed = SessionStateMachine::load_for_resume(store.as_ref(), &result.session_id).unwrap();
    let users = resumed.target("users").unwrap();
    assert_eq!(users.status, TargetStatus::Completed);
    assert_eq!(users.attempts, 2);

    // The crashed session was handed over and is not offered again
    let crashed = SessionStateMachine::load_for_resume(store.as_ref(), &crashed_id).unwrap();
    assert_eq!(crashed.status, RunStatus::Failed);
    assert_eq!(
        crashed.failure,
        Some(format!("resumed as {}", result.session_id))
    );
    assert_eq!(latest_resumable(store.as_ref()).unwrap(), None);
}

#[tokio::test]
async fn test_successful_routes_are_cached() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let cache_path = dir.path().join("routes.json");
    let browser = site();
    let store = Arc::new(MemorySnapshotStore::new());

    let cache = RouteCacheStore::new(&cache_path, HOME, std::time::Duration::from_secs(3600));
    let mut first = runner(&browser, &store, dir.path())
        .with_engine(None)
        .with_cache(cache);
    first.run(&targets()[..2]).await.unwrap();

    let cache = RouteCacheStore::load(&cache_path, HOME, std::time::Duration::from_secs(3600));
    assert_eq!(cache.len(), 2);
    assert_eq!(
        cache.route_for("Reports").map(|r| r.url.as_str()),
        Some("https://app.test/reports")
    );

    // With a cached route the runner navigates instead of tapping
    browser.navigate(HOME).await.unwrap();
    let taps_before = browser.call_count("tap");
    let mut second = runner(&browser, &store, dir.path())
        .with_engine(None)
        .with_cache(cache);
    second.run(&targets()[..1]).await.unwrap();
    assert_eq!(browser.call_count("tap"), taps_before);
    assert!(browser
        .calls()
        .contains(&"navigate:https://app.test/reports".to_string()));
}

#[tokio::test]
async fn test_excursion_is_not_captured_under_foreign_key() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let blue = [0, 0, 255, 255];
    let red = [255, 0, 0, 255];
    let green = [0, 160, 0, 255];
    let browser = Arc::new(
        MockBrowser::new()
            .with_viewport(48, 32)
            .page(
                HOME,
                MockPage::new()
                    .color(blue)
                    .link(prompts::menu_entry("Help"), "https://docs.vendor.net/help"),
            )
            .page("https://docs.vendor.net/help", MockPage::new().color(red))
            .page("https://app.test/billing", MockPage::new().color(green))
            .start_at(HOME),
    );
    let store = Arc::new(MemorySnapshotStore::new());

    let result = runner(&browser, &store, dir.path())
        .run(&[
            TargetDescriptor::new("help", "Help"),
            TargetDescriptor::new("billing", "Billing").url("https://app.test/billing"),
        ])
        .await
        .unwrap();

    let help = &result.targets[0];
    assert!(help.success);
    assert!(help.navigation.as_ref().unwrap().return_success);
    assert_eq!(help.comparison, None);
    assert!(!dir.path().join("baseline").join("help.png").exists());
    assert_eq!(browser.call_count("screenshot"), 1);

    // The in-boundary baseline holds the page it is named after
    let baseline = std::fs::read(dir.path().join("baseline").join("billing.png")).unwrap();
    let bitmap = Bitmap::from_png_bytes(&baseline).unwrap();
    assert_eq!(bitmap.get_pixel(47, 31), green);
}

#[tokio::test]
async fn test_unreturned_excursion_fails_when_escalated() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = Arc::new(MemorySnapshotStore::new());
    let docs = [TargetDescriptor::new("docs", "Docs")];

    for escalate in [false, true] {
        let browser = site();
        // Both return strategies fail: go back, then navigate to the anchor
        browser.fail_next("go_back", "history unavailable", 1);
        browser.fail_next("navigate", "net::ERR_ABORTED", 1);

        let result = Runner::new(
            browser.clone(),
            store.clone(),
            &Config::defaults(),
            RunOptions::new(HOME).escalate_cross_domain(escalate),
        )
        .with_retry(RetryClassifier::new(browser.clone(), RetryPolicy::immediate()))
        .with_boundary(BoundaryPolicy::new(["app.test"]))
        .with_engine(Some(RegressionEngine::new(EngineConfig::in_dir(dir.path()))))
        .run(&docs)
        .await
        .unwrap();

        let outcome = &result.targets[0];
        let nav = outcome.navigation.as_ref().unwrap();
        assert!(nav.is_cross_domain);
        assert!(!nav.return_success);
        assert_eq!(outcome.success, !escalate);
        if escalate {
            assert_eq!(
                outcome.error.as_deref(),
                Some("could not return inside boundary 'app.test' from https://docs.vendor.net/")
            );
        }
    }
}
