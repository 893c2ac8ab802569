//! Bounded retries with failure-kind specific recovery.
//!
//! Every perception or interaction call made for a target goes through
//! [`RetryClassifier::execute_with_retry`]. A failure message is classified
//! into a [`FailureKind`], the matching recovery action runs against the
//! capability, and the operation is retried after a fixed backoff. The
//! classifier never returns an error: every outcome, including exhaustion,
//! is a [`RetryOutcome`].

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, CapabilityResult, bounded, prompts};
use crate::config::Config;
use crate::error::{RegressError, RegressResult};

const LOG_TARGET: &str = "menu_regress::retry";

/// Category of a failed attempt, chosen from its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Element,
    Navigation,
    Auth,
    /// Nothing matched; the generic recovery applies
    Generic,
}

/// Checked in order; the first kind with a matching keyword wins.
const CLASSIFICATION: &[(FailureKind, &[&str])] = &[
    (FailureKind::Timeout, &["timeout", "timed out"]),
    (
        FailureKind::Element,
        &["element", "selector", "not visible", "not clickable"],
    ),
    (
        FailureKind::Navigation,
        &["navigation", "navigate", "page", "net::err"],
    ),
    (
        FailureKind::Auth,
        &["auth", "login", "unauthorized", "forbidden", "credential"],
    ),
];

impl FailureKind {
    /// Case-insensitive substring classification
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        CLASSIFICATION
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(FailureKind::Generic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Element => "element",
            FailureKind::Navigation => "navigation",
            FailureKind::Auth => "auth",
            FailureKind::Generic => "generic",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operation is about, for recovery and logging
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub operation: String,
    /// URL to return to when a navigation failure is recovered
    pub initial_url: Option<String>,
    /// Element to scroll-search for when an element failure is recovered
    pub target_description: Option<String>,
    /// Run the pre-check on every attempt, not only the first
    pub force_precheck: bool,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn initial_url(mut self, url: impl Into<String>) -> Self {
        self.initial_url = Some(url.into());
        self
    }

    pub fn target(mut self, description: impl Into<String>) -> Self {
        self.target_description = Some(description.into());
        self
    }

    pub fn force_precheck(mut self, force: bool) -> Self {
        self.force_precheck = force;
        self
    }
}

/// Timing of retries and recovery actions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed wait between attempts
    pub backoff: Duration,
    /// Wait used when a timed-out page is still responsive
    pub extended_wait: Duration,
    /// Pause before the generic responsiveness check
    pub generic_delay: Duration,
    /// Bound on each responsiveness check
    pub check_timeout: Duration,
    /// Bound on waiting for page stability
    pub stability_timeout: Duration,
    /// Scroll steps while searching for an element
    pub scroll_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
            extended_wait: Duration::from_secs(5),
            generic_delay: Duration::from_secs(2),
            check_timeout: Duration::from_secs(10),
            stability_timeout: Duration::from_secs(10),
            scroll_attempts: 3,
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.retry.max_retries,
            backoff: Duration::from_millis(cfg.retry.backoff_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// No waiting anywhere; for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            backoff: Duration::ZERO,
            extended_wait: Duration::ZERO,
            generic_delay: Duration::ZERO,
            check_timeout: Duration::from_secs(1),
            stability_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Best-effort hook run before the first attempt
#[async_trait]
pub trait PreCheck: Send + Sync {
    async fn run(&self, capability: &dyn Capability) -> CapabilityResult<()>;
}

/// Dismisses a transient popup or overlay if one is showing
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayDismisser;

#[async_trait]
impl PreCheck for OverlayDismisser {
    async fn run(&self, capability: &dyn Capability) -> CapabilityResult<()> {
        if capability.query_boolean(prompts::OVERLAY_PRESENT).await? {
            tracing::debug!(target: LOG_TARGET, "dismissing overlay before first attempt");
            capability.tap(prompts::DISMISS_OVERLAY).await?;
        }
        Ok(())
    }
}

/// Re-establishes an authenticated session
#[async_trait]
pub trait CredentialInjector: Send + Sync {
    async fn inject(&self, capability: &dyn Capability) -> CapabilityResult<()>;
}

/// Result of one `execute_with_retry` call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub attempts_used: u32,
    pub last_error: Option<String>,
    /// Classification of the last failure
    pub last_kind: Option<FailureKind>,
}

impl<T> RetryOutcome<T> {
    /// Exhaustion becomes `RetryExhausted`
    pub fn into_result(self) -> RegressResult<T> {
        match self.data {
            Some(data) if self.success => Ok(data),
            _ => Err(RegressError::RetryExhausted {
                attempts: self.attempts_used,
                message: self
                    .last_error
                    .unwrap_or_else(|| "operation failed".to_string()),
            }),
        }
    }
}

pub struct RetryClassifier {
    capability: Arc<dyn Capability>,
    policy: RetryPolicy,
    precheck: Option<Arc<dyn PreCheck>>,
    credentials: Option<Arc<dyn CredentialInjector>>,
}

impl RetryClassifier {
    /// Classifier with the overlay pre-check and no credential injector
    pub fn new(capability: Arc<dyn Capability>, policy: RetryPolicy) -> Self {
        Self {
            capability,
            policy,
            precheck: Some(Arc::new(OverlayDismisser)),
            credentials: None,
        }
    }

    pub fn with_precheck(mut self, precheck: Option<Arc<dyn PreCheck>>) -> Self {
        self.precheck = precheck;
        self
    }

    pub fn with_credentials(mut self, injector: Arc<dyn CredentialInjector>) -> Self {
        self.credentials = Some(injector);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` up to `max_retries + 1` times.
    ///
    /// Recovery runs after every failure; its result is only logged. The
    /// backoff between attempts is constant.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        context: &RetryContext,
        max_retries: u32,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = max_retries.saturating_add(1);
        let mut last_error = None;
        let mut last_kind = None;

        for attempt in 1..=max_attempts {
            if attempt == 1 || context.force_precheck {
                self.run_precheck(context).await;
            }

            match operation().await {
                Ok(data) => {
                    if attempt > 1 {
                        tracing::info!(
                            target: LOG_TARGET,
                            operation = %context.operation,
                            attempt,
                            "succeeded after retry"
                        );
                    }
                    return RetryOutcome {
                        success: true,
                        data: Some(data),
                        attempts_used: attempt,
                        last_error: None,
                        last_kind: None,
                    };
                }
                Err(e) => {
                    let message = e.to_string();
                    let kind = FailureKind::classify(&message);
                    tracing::warn!(
                        target: LOG_TARGET,
                        operation = %context.operation,
                        attempt,
                        max_attempts,
                        kind = %kind,
                        error = %message,
                        "attempt failed"
                    );

                    let recovered = self.recover(kind, context).await;
                    tracing::debug!(target: LOG_TARGET, kind = %kind, recovered, "recovery finished");

                    last_error = Some(message);
                    last_kind = Some(kind);

                    if attempt < max_attempts && !self.policy.backoff.is_zero() {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        tracing::warn!(
            target: LOG_TARGET,
            operation = %context.operation,
            attempts = max_attempts,
            "retries exhausted"
        );
        RetryOutcome {
            success: false,
            data: None,
            attempts_used: max_attempts,
            last_error,
            last_kind,
        }
    }

    async fn run_precheck(&self, context: &RetryContext) {
        let Some(precheck) = &self.precheck else {
            return;
        };
        if let Err(e) = precheck.run(self.capability.as_ref()).await {
            tracing::debug!(
                target: LOG_TARGET,
                operation = %context.operation,
                error = %e,
                "pre-check failed, continuing"
            );
        }
    }

    /// Run the recovery action for `kind`; true when it reports success
    async fn recover(&self, kind: FailureKind, context: &RetryContext) -> bool {
        match kind {
            FailureKind::Timeout => {
                if self.is_responsive().await {
                    self.wait_stable(self.policy.extended_wait).await
                } else {
                    self.reload(context).await
                }
            }
            FailureKind::Element => {
                let stable = self.wait_stable(self.policy.stability_timeout).await;
                match &context.target_description {
                    Some(description) => self.scroll_search(description).await,
                    None => stable,
                }
            }
            FailureKind::Navigation => match &context.initial_url {
                Some(url) => self.navigate(url).await,
                None => self.reload(context).await,
            },
            FailureKind::Auth => match &self.credentials {
                Some(injector) => match injector.inject(self.capability.as_ref()).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(target: LOG_TARGET, error = %e, "credential injection failed");
                        false
                    }
                },
                None => false,
            },
            FailureKind::Generic => {
                if !self.policy.generic_delay.is_zero() {
                    tokio::time::sleep(self.policy.generic_delay).await;
                }
                self.is_responsive().await
            }
        }
    }

    async fn is_responsive(&self) -> bool {
        bounded(
            self.policy.check_timeout,
            self.capability.query_boolean(prompts::RESPONSIVE),
        )
        .await
        .unwrap_or(false)
    }

    async fn wait_stable(&self, timeout: Duration) -> bool {
        // A zero wait still gives the capability one chance to answer
        let bound = timeout.max(self.policy.check_timeout);
        bounded(
            bound,
            self.capability.wait_for_condition(prompts::PAGE_STABLE, timeout),
        )
        .await
        .is_ok()
    }

    async fn navigate(&self, url: &str) -> bool {
        match bounded(self.policy.stability_timeout, self.capability.navigate(url)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(target: LOG_TARGET, url, error = %e, "recovery navigation failed");
                false
            }
        }
    }

    /// Reload the current page, or the initial URL if the current one is unknown
    async fn reload(&self, context: &RetryContext) -> bool {
        let current = bounded(self.policy.check_timeout, self.capability.current_url())
            .await
            .ok()
            .or_else(|| context.initial_url.clone());
        match current {
            Some(url) => self.navigate(&url).await,
            None => false,
        }
    }

    async fn scroll_search(&self, description: &str) -> bool {
        let question = prompts::element_visible(description);
        for _ in 0..=self.policy.scroll_attempts {
            let visible = bounded(self.policy.check_timeout, self.capability.query_boolean(&question))
                .await
                .unwrap_or(false);
            if visible {
                return true;
            }
            if bounded(self.policy.check_timeout, self.capability.tap(prompts::SCROLL_DOWN))
                .await
                .is_err()
            {
                return false;
            }
        }
        false
    }
}
