//! Sequential run over a list of targets.
//!
//! For each target: mark it running, perform the action (navigate or tap,
//! then validate) through the retry classifier, check the navigation
//! boundary, compare a screenshot if enabled, and record the outcome.
//! Cancellation is checked between targets only.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::RouteCacheStore;
use crate::capability::{Capability, CapabilityError, bounded, prompts};
use crate::config::Config;
use crate::error::RegressResult;
use crate::navigation::{BoundaryPolicy, NavigationOutcome, NavigationRecoveryManager};
use crate::regression::{ComparisonOutcome, EngineConfig, RegressionEngine, ScreenshotKey};
use crate::retry::{RetryClassifier, RetryContext, RetryPolicy};
use crate::session::{
    RunStatus, RunSummary, SessionStateMachine, SnapshotStore, TargetDescriptor, TargetResult,
};
use crate::validate::{PageValidator, ValidationRules};

const LOG_TARGET: &str = "menu_regress::runner";

/// Per-run choices that are not part of the global configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Application entry point, used when the browser cannot report its URL
    pub app_url: String,
    /// Capture and compare a screenshot per target
    pub screenshots: bool,
    /// Scenario suffix for screenshot keys
    pub scenario: Option<String>,
    /// Overflow menu holding entries deeper than level 1
    pub overflow_label: Option<String>,
    /// Fail a target whose navigation left the boundary and could not return
    pub escalate_cross_domain: bool,
    /// Bound on single capability calls made by the runner itself
    pub call_timeout: Duration,
}

impl RunOptions {
    pub fn new(app_url: impl Into<String>) -> Self {
        Self {
            app_url: app_url.into(),
            screenshots: true,
            scenario: None,
            overflow_label: None,
            escalate_cross_domain: false,
            call_timeout: Duration::from_secs(30),
        }
    }

    pub fn screenshots(mut self, enabled: bool) -> Self {
        self.screenshots = enabled;
        self
    }

    pub fn scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    pub fn overflow_label(mut self, label: impl Into<String>) -> Self {
        self.overflow_label = Some(label.into());
        self
    }

    pub fn escalate_cross_domain(mut self, escalate: bool) -> Self {
        self.escalate_cross_domain = escalate;
        self
    }
}

/// What happened to one target
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub id: String,
    pub success: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub attempts_used: u32,
    pub navigation: Option<NavigationOutcome>,
    pub comparison: Option<ComparisonOutcome>,
}

impl TargetOutcome {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            skipped: false,
            error: None,
            attempts_used: 0,
            navigation: None,
            comparison: None,
        }
    }
}

/// Result of a complete run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub session_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    pub cancelled: bool,
    #[serde(skip)]
    pub targets: Vec<TargetOutcome>,
}

impl RunResult {
    /// No target failed and the run was not cancelled
    pub fn success(&self) -> bool {
        !self.cancelled && self.summary.failed == 0
    }
}

pub struct Runner {
    capability: Arc<dyn Capability>,
    store: Arc<dyn SnapshotStore>,
    retry: RetryClassifier,
    navigation: NavigationRecoveryManager,
    validator: PageValidator,
    engine: Option<RegressionEngine>,
    cache: Option<RouteCacheStore>,
    options: RunOptions,
    session_id: Option<String>,
    resumed_from: Option<String>,
    cancel: Arc<AtomicBool>,
}

impl Runner {
    /// Runner with every component configured from `config`
    pub fn new(
        capability: Arc<dyn Capability>,
        store: Arc<dyn SnapshotStore>,
        config: &Config,
        options: RunOptions,
    ) -> Self {
        let engine = options
            .screenshots
            .then(|| RegressionEngine::new(EngineConfig::from(config)));
        Self {
            retry: RetryClassifier::new(capability.clone(), RetryPolicy::from(config)),
            navigation: NavigationRecoveryManager::new(capability.clone(), BoundaryPolicy::from(config)),
            validator: PageValidator::new(capability.clone()),
            capability,
            store,
            engine,
            cache: None,
            options,
            session_id: None,
            resumed_from: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry(mut self, retry: RetryClassifier) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_boundary(mut self, policy: BoundaryPolicy) -> Self {
        self.navigation = NavigationRecoveryManager::new(self.capability.clone(), policy);
        self
    }

    /// Replace (or disable, with `None`) screenshot comparison
    pub fn with_engine(mut self, engine: Option<RegressionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cache(mut self, cache: RouteCacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// The targets come from the crashed session `id`; once the new session
    /// is started, `id` is closed so it is not offered for resume again
    pub fn resuming(mut self, id: impl Into<String>) -> Self {
        self.resumed_from = Some(id.into());
        self
    }

    /// Share an externally owned cancel flag
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cache(&self) -> Option<&RouteCacheStore> {
        self.cache.as_ref()
    }

    /// Run every target in order. Only session setup errors are returned;
    /// target failures end up in the summary.
    pub async fn run(&mut self, targets: &[TargetDescriptor]) -> RegressResult<RunResult> {
        let mut machine = match self.session_id.take() {
            Some(id) => SessionStateMachine::with_id(self.store.clone(), id),
            None => SessionStateMachine::new(self.store.clone()),
        };
        machine.initialize(targets)?;
        if let Some(source) = self.resumed_from.take() {
            match SessionStateMachine::mark_resumed(self.store.clone(), &source, machine.session_id()) {
                Ok(()) => tracing::info!(target: LOG_TARGET, source = %source, "resumed session closed"),
                Err(e) => tracing::warn!(target: LOG_TARGET, source = %source, error = %e, "resumed session left open"),
            }
        }
        tracing::info!(
            target: LOG_TARGET,
            session = machine.session_id(),
            targets = targets.len(),
            "run started"
        );

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut cancelled = false;

        for target in targets {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                tracing::warn!(target: LOG_TARGET, "run cancelled, remaining targets stay pending");
                break;
            }
            outcomes.push(self.process_target(&mut machine, target).await);
        }

        self.save_cache();

        let summary = if cancelled {
            machine.fail("cancelled")?;
            machine.summary("cancelled")
        } else {
            let s = machine.session();
            let message = format!(
                "{} of {} targets passed, {} failed, {} skipped",
                s.completed_menus, s.total_menus, s.failed_menus, s.skipped_menus
            );
            let summary = machine.summary(message);
            machine.complete(summary.clone())?;
            summary
        };

        Ok(RunResult {
            session_id: machine.session_id().to_string(),
            status: machine.session().status,
            summary,
            cancelled,
            targets: outcomes,
        })
    }

    async fn process_target(
        &mut self,
        machine: &mut SessionStateMachine,
        target: &TargetDescriptor,
    ) -> TargetOutcome {
        let mut outcome = TargetOutcome::new(&target.id);

        if let Err(e) = machine.start_target(&target.id) {
            tracing::warn!(target: LOG_TARGET, id = %target.id, error = %e, "target not started");
            outcome.error = Some(e.to_string());
            return outcome;
        }

        let initial_url = bounded(self.options.call_timeout, self.capability.current_url())
            .await
            .unwrap_or_else(|_| self.options.app_url.clone());

        let route = target.url.clone().or_else(|| {
            self.cache
                .as_ref()
                .and_then(|c| c.route_for(&target.display_text))
                .map(|entry| entry.original_url.clone())
        });

        if route.is_none() && target.level > 1 {
            if let Some(label) = self.options.overflow_label.clone() {
                if !self.navigation.ensure_expanded(&label).await {
                    let reason = format!("could not expand '{}' menu", label);
                    record(machine, &target.id, |m| m.skip_target(&target.id, &reason));
                    outcome.skipped = true;
                    outcome.error = Some(reason);
                    return outcome;
                }
            }
        }

        let action = self.perform_action(target, route.as_deref(), &initial_url).await;
        outcome.attempts_used = action.attempts_used;

        let final_url = match action.into_result() {
            Ok(url) => url,
            Err(e) => {
                let message = e.to_string();
                record(machine, &target.id, |m| {
                    m.complete_target(&target.id, TargetResult::failed(message.clone()))
                });
                outcome.error = Some(message);
                return outcome;
            }
        };

        let navigation = self.navigation.check_navigation(&initial_url, &final_url).await;
        let left_boundary = navigation.is_cross_domain && !navigation.return_success;
        let boundary_failure = if left_boundary && self.options.escalate_cross_domain {
            navigation.clone().escalate().err().map(|e| e.to_string())
        } else {
            None
        };
        outcome.navigation = Some(navigation);

        let mut result = match boundary_failure {
            Some(message) => TargetResult::failed(message),
            None => TargetResult::passed(),
        };

        // The browser is back inside the boundary by now, so a capture
        // would show a different page than `final_url` names
        let capture_url = outcome
            .navigation
            .as_ref()
            .filter(|n| !n.is_cross_domain)
            .map(|_| final_url.as_str());
        if capture_url.is_none() && self.engine.is_some() {
            tracing::debug!(target: LOG_TARGET, id = %target.id, url = %final_url, "outside the boundary, screenshot skipped");
        }

        if let (Some(engine), Some(url)) = (&self.engine, capture_url) {
            let comparison = self.capture_and_compare(engine, target, url).await;
            if let Some(comparison) = &comparison {
                if let Some(path) = comparison.reference_path() {
                    result = result.with_screenshot(path.display().to_string());
                }
                if result.success && comparison.fails_target(engine.config().fail_on_diff) {
                    result.success = false;
                    result.error = Some(comparison.summary());
                }
            }
            outcome.comparison = comparison;
        }

        if result.success {
            if let Some(cache) = self.cache.as_mut() {
                cache.record_route(&target.display_text, &final_url, target.level, None);
            }
        }

        outcome.success = result.success;
        outcome.error = result.error.clone();
        record(machine, &target.id, |m| m.complete_target(&target.id, result));
        outcome
    }

    /// Navigate or tap, then validate, under the retry classifier
    async fn perform_action(
        &self,
        target: &TargetDescriptor,
        route: Option<&str>,
        initial_url: &str,
    ) -> crate::retry::RetryOutcome<String> {
        let mut context = RetryContext::new(format!("test {}", target.id)).initial_url(initial_url);
        if route.is_none() {
            context = context.target(prompts::menu_entry(&target.display_text));
        }

        let capability = self.capability.as_ref();
        let validator = &self.validator;
        let cache = self.cache.as_ref();
        let text = target.display_text.as_str();
        let timeout = self.options.call_timeout;

        self.retry
            .execute_with_retry(&context, self.retry.policy().max_retries, move || async move {
                match route {
                    Some(url) => bounded(timeout, capability.navigate(url)).await?,
                    None => bounded(timeout, capability.tap(&prompts::menu_entry(text))).await?,
                }
                let url = bounded(timeout, capability.current_url()).await?;
                let rules = cache
                    .and_then(|c| c.rules_for_url(&url))
                    .cloned()
                    .unwrap_or_else(ValidationRules::default);
                let report = validator.validate(&url, &rules).await?;
                if !report.passed {
                    return Err(CapabilityError::Failed(format!(
                        "validation failed: {}",
                        report.reason.unwrap_or_default()
                    )));
                }
                Ok::<_, CapabilityError>(url)
            })
            .await
    }

    /// Screenshot and compare; capture failures are inconclusive
    async fn capture_and_compare(
        &self,
        engine: &RegressionEngine,
        target: &TargetDescriptor,
        url: &str,
    ) -> Option<ComparisonOutcome> {
        let key = ScreenshotKey::derive(Some(url), &target.display_text, self.options.scenario.as_deref());
        match bounded(self.options.call_timeout, self.capability.screenshot()).await {
            Ok(bytes) => Some(engine.compare_or_save_baseline(&key, &bytes)),
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, id = %target.id, key = %key, error = %e, "screenshot capture failed");
                None
            }
        }
    }

    fn save_cache(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.save() {
                tracing::warn!(target: LOG_TARGET, error = %e, "route cache not saved");
            }
        }
    }
}

/// Apply a session update; rejected transitions are logged, not fatal to the run
fn record<F>(machine: &mut SessionStateMachine, id: &str, update: F)
where
    F: FnOnce(&mut SessionStateMachine) -> RegressResult<()>,
{
    if let Err(e) = update(machine) {
        tracing::warn!(target: LOG_TARGET, id, error = %e, "session update rejected");
    }
}
