//! Detection of and recovery from navigation outside the owned domains.
//!
//! A navigation is cross-boundary when the URL before the action contains
//! one of the configured boundary substrings and the URL after it does not.
//! Leaving the boundary is never fatal: the outcome reports success and
//! carries a `return_success` flag the caller may escalate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, bounded, prompts};
use crate::config::Config;
use crate::error::{RegressError, RegressResult};

const LOG_TARGET: &str = "menu_regress::navigation";

/// Boundary settings for one run
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    /// Substrings identifying owned URLs
    pub domain_patterns: Vec<String>,
    /// Where to go when going back does not return inside the boundary
    pub anchor_url: Option<String>,
    /// Total return attempts across all strategies
    pub max_return_attempts: u32,
    /// Bound on each strategy
    pub strategy_timeout: Duration,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            domain_patterns: Vec::new(),
            anchor_url: None,
            max_return_attempts: crate::config::DEFAULT_MAX_RETURN_ATTEMPTS,
            strategy_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for BoundaryPolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            domain_patterns: cfg.boundary.domain_patterns.clone(),
            anchor_url: cfg.boundary.anchor_url.clone(),
            max_return_attempts: cfg.boundary.max_return_attempts,
            ..Self::default()
        }
    }
}

impl BoundaryPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain_patterns: patterns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn anchor(mut self, url: impl Into<String>) -> Self {
        self.anchor_url = Some(url.into());
        self
    }

    pub fn max_return_attempts(mut self, attempts: u32) -> Self {
        self.max_return_attempts = attempts;
        self
    }

    pub fn strategy_timeout(mut self, timeout: Duration) -> Self {
        self.strategy_timeout = timeout;
        self
    }
}

/// The boundary `initial_url` was inside and `current_url` left, if any
pub fn is_cross_boundary<'a>(
    initial_url: &str,
    current_url: &str,
    patterns: &'a [String],
) -> Option<&'a str> {
    patterns
        .iter()
        .find(|b| initial_url.contains(b.as_str()) && !current_url.contains(b.as_str()))
        .map(String::as_str)
}

/// Ways of getting back inside the boundary, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnStrategy {
    GoBack,
    Anchor,
}

/// What happened around one action
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationOutcome {
    /// Always true: leaving the boundary does not fail the action
    pub success: bool,
    pub is_cross_domain: bool,
    /// The page is inside the boundary after recovery (true when it never left)
    pub return_success: bool,
    /// Boundary that was left
    pub boundary: Option<String>,
    /// URL observed after recovery
    pub final_url: Option<String>,
    /// Strategies tried, in order
    pub strategies: Vec<ReturnStrategy>,
}

impl NavigationOutcome {
    fn stayed(url: Option<String>) -> Self {
        Self {
            success: true,
            is_cross_domain: false,
            return_success: true,
            boundary: None,
            final_url: url,
            strategies: Vec::new(),
        }
    }

    /// Turn a failed return into `CrossDomainReturnFailed`
    pub fn escalate(self) -> RegressResult<Self> {
        if self.is_cross_domain && !self.return_success {
            return Err(RegressError::CrossDomainReturnFailed {
                boundary: self.boundary.unwrap_or_default(),
                url: self.final_url.unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

pub struct NavigationRecoveryManager {
    capability: Arc<dyn Capability>,
    policy: BoundaryPolicy,
    expanded: HashSet<String>,
}

impl NavigationRecoveryManager {
    pub fn new(capability: Arc<dyn Capability>, policy: BoundaryPolicy) -> Self {
        Self {
            capability,
            policy,
            expanded: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &BoundaryPolicy {
        &self.policy
    }

    /// Read the current URL and check it against `initial_url`
    pub async fn inspect(&self, initial_url: &str) -> NavigationOutcome {
        match bounded(self.policy.strategy_timeout, self.capability.current_url()).await {
            Ok(current) => self.check_navigation(initial_url, &current).await,
            Err(e) => {
                tracing::debug!(target: LOG_TARGET, error = %e, "current url unavailable, skipping boundary check");
                NavigationOutcome::stayed(None)
            }
        }
    }

    /// Compare before/after URLs and try to return if the boundary was left
    pub async fn check_navigation(&self, initial_url: &str, current_url: &str) -> NavigationOutcome {
        let Some(boundary) = is_cross_boundary(initial_url, current_url, &self.policy.domain_patterns)
        else {
            return NavigationOutcome::stayed(Some(current_url.to_string()));
        };

        tracing::info!(
            target: LOG_TARGET,
            boundary,
            from = initial_url,
            to = current_url,
            "navigation left the boundary"
        );

        let mut outcome = NavigationOutcome {
            success: true,
            is_cross_domain: true,
            return_success: false,
            boundary: Some(boundary.to_string()),
            final_url: Some(current_url.to_string()),
            strategies: Vec::new(),
        };

        let anchor = self
            .policy
            .anchor_url
            .clone()
            .unwrap_or_else(|| initial_url.to_string());
        let order = [ReturnStrategy::GoBack, ReturnStrategy::Anchor];

        for attempt in 0..self.policy.max_return_attempts as usize {
            let strategy = order[attempt % order.len()];
            outcome.strategies.push(strategy);

            let moved = match strategy {
                ReturnStrategy::GoBack => {
                    bounded(self.policy.strategy_timeout, self.capability.go_back()).await
                }
                ReturnStrategy::Anchor => {
                    bounded(self.policy.strategy_timeout, self.capability.navigate(&anchor)).await
                }
            };
            if let Err(e) = moved {
                tracing::debug!(target: LOG_TARGET, ?strategy, error = %e, "return strategy failed");
                continue;
            }

            let Ok(url) = bounded(self.policy.strategy_timeout, self.capability.current_url()).await
            else {
                continue;
            };
            let inside = url.contains(boundary);
            outcome.final_url = Some(url);
            if inside {
                outcome.return_success = true;
                tracing::info!(target: LOG_TARGET, ?strategy, boundary, "returned inside boundary");
                return outcome;
            }
        }

        tracing::warn!(
            target: LOG_TARGET,
            boundary,
            url = outcome.final_url.as_deref().unwrap_or_default(),
            attempts = outcome.strategies.len(),
            "could not return inside boundary"
        );
        outcome
    }

    /// Open an overflow/"more" menu once per session.
    ///
    /// Returns true when the menu is (now) expanded. Failed expansions are
    /// not remembered.
    pub async fn ensure_expanded(&mut self, label: &str) -> bool {
        if self.expanded.contains(label) {
            return true;
        }
        match bounded(
            self.policy.strategy_timeout,
            self.capability.tap(&prompts::expand_menu(label)),
        )
        .await
        {
            Ok(()) => {
                self.expanded.insert(label.to_string());
                true
            }
            Err(e) => {
                tracing::debug!(target: LOG_TARGET, label, error = %e, "menu expansion failed");
                false
            }
        }
    }

    pub fn is_expanded(&self, label: &str) -> bool {
        self.expanded.contains(label)
    }

    /// Forget expansions, e.g. after a full page reload
    pub fn reset_expanded(&mut self) {
        self.expanded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{MockBrowser, MockPage};
    use pretty_assertions::assert_eq;

    const APP: &str = "https://app.example.com/home";
    const SSO: &str = "https://sso.vendor.net/login";

    fn patterns() -> Vec<String> {
        vec!["app.example.com".to_string()]
    }

    fn browser() -> Arc<MockBrowser> {
        Arc::new(
            MockBrowser::new()
                .page(APP, MockPage::new())
                .page(SSO, MockPage::new())
                .start_at(APP)
                .start_at(SSO),
        )
    }

    #[test]
    fn test_is_cross_boundary() {
        let p = patterns();
        assert_eq!(is_cross_boundary(APP, SSO, &p), Some("app.example.com"));
        assert_eq!(is_cross_boundary(APP, "https://app.example.com/x", &p), None);
        // Starting outside the boundary is never a crossing
        assert_eq!(is_cross_boundary(SSO, APP, &p), None);
        assert_eq!(is_cross_boundary(APP, SSO, &[]), None);
    }

    #[tokio::test]
    async fn test_same_domain_is_not_an_excursion() {
        let browser = browser();
        let manager = NavigationRecoveryManager::new(browser.clone(), BoundaryPolicy::new(patterns()));
        let outcome = manager
            .check_navigation(APP, "https://app.example.com/reports")
            .await;
        assert!(outcome.success);
        assert!(!outcome.is_cross_domain);
        assert!(outcome.return_success);
        assert_eq!(browser.call_count("go_back"), 0);
    }

    #[tokio::test]
    async fn test_go_back_returns_inside() {
        let browser = browser();
        let manager = NavigationRecoveryManager::new(browser.clone(), BoundaryPolicy::new(patterns()));

        let outcome = manager.inspect(APP).await;
        assert!(outcome.success);
        assert!(outcome.is_cross_domain);
        assert!(outcome.return_success);
        assert_eq!(outcome.strategies, vec![ReturnStrategy::GoBack]);
        assert_eq!(outcome.final_url.as_deref(), Some(APP));
    }

    #[tokio::test]
    async fn test_anchor_used_when_go_back_fails() {
        let browser = browser();
        browser.fail_next("go_back", "history unavailable", 1);
        let policy = BoundaryPolicy::new(patterns()).anchor("https://app.example.com/");
        let manager = NavigationRecoveryManager::new(browser.clone(), policy);

        let outcome = manager.check_navigation(APP, SSO).await;
        assert!(outcome.return_success);
        assert_eq!(
            outcome.strategies,
            vec![ReturnStrategy::GoBack, ReturnStrategy::Anchor]
        );
        assert_eq!(browser.current().as_deref(), Some("https://app.example.com/"));
    }

    #[tokio::test]
    async fn test_failed_return_is_flagged_not_fatal() {
        let browser = browser();
        browser.fail_next("go_back", "history unavailable", 5);
        browser.fail_next("navigate", "net::ERR_FAILED", 5);
        let policy = BoundaryPolicy::new(patterns()).max_return_attempts(3);
        let manager = NavigationRecoveryManager::new(browser.clone(), policy);

        let outcome = manager.check_navigation(APP, SSO).await;
        assert!(outcome.success);
        assert!(outcome.is_cross_domain);
        assert!(!outcome.return_success);
        assert_eq!(outcome.strategies.len(), 3);
        assert!(matches!(
            outcome.escalate(),
            Err(RegressError::CrossDomainReturnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_return_attempts_tries_nothing() {
        let browser = browser();
        let policy = BoundaryPolicy::new(patterns()).max_return_attempts(0);
        let manager = NavigationRecoveryManager::new(browser.clone(), policy);

        let outcome = manager.check_navigation(APP, SSO).await;
        assert!(!outcome.return_success);
        assert!(outcome.strategies.is_empty());
        assert_eq!(browser.call_count("go_back"), 0);
    }

    #[tokio::test]
    async fn test_ensure_expanded_is_idempotent() {
        let browser = browser();
        let mut manager = NavigationRecoveryManager::new(browser.clone(), BoundaryPolicy::default());

        assert!(manager.ensure_expanded("More").await);
        assert!(manager.ensure_expanded("More").await);
        assert_eq!(browser.call_count("tap"), 1);
        assert!(manager.is_expanded("More"));

        manager.reset_expanded();
        assert!(manager.ensure_expanded("More").await);
        assert_eq!(browser.call_count("tap"), 2);
    }

    #[tokio::test]
    async fn test_failed_expansion_is_not_remembered() {
        let browser = browser();
        browser.fail_next("tap", "element not found", 1);
        let mut manager = NavigationRecoveryManager::new(browser.clone(), BoundaryPolicy::default());

        assert!(!manager.ensure_expanded("More").await);
        assert!(!manager.is_expanded("More"));
        assert!(manager.ensure_expanded("More").await);
    }
}
