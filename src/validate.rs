//! Layered page validation.
//!
//! Layer 1 checks the URL against the target's rules and costs nothing.
//! Layer 2 asks the perception agent: blank page, error page, then each
//! custom assertion. The first failing check decides the report.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Capability, CapabilityResult, bounded, prompts};

const LOG_TARGET: &str = "menu_regress::validate";

/// Validation rules stored with a route.
///
/// Unknown keys are kept so a cache written by a newer tool survives a
/// round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRules {
    /// Substring the page URL must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_contains: Option<String>,
    #[serde(default = "default_forbid_blank")]
    pub forbid_blank: bool,
    /// Yes/no questions that must be answered yes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_forbid_blank() -> bool {
    true
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            url_contains: None,
            forbid_blank: true,
            assertions: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl ValidationRules {
    pub fn url_contains(mut self, fragment: impl Into<String>) -> Self {
        self.url_contains = Some(fragment.into());
        self
    }

    pub fn assert(mut self, question: impl Into<String>) -> Self {
        self.assertions.push(question.into());
        self
    }

    pub fn allow_blank(mut self) -> Self {
        self.forbid_blank = false;
        self
    }
}

/// Which layer produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLayer {
    Url,
    Perception,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub passed: bool,
    pub reason: Option<String>,
    /// Layer that failed, if any
    pub layer: Option<ValidationLayer>,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            layer: None,
        }
    }

    fn fail(layer: ValidationLayer, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            layer: Some(layer),
        }
    }
}

pub struct PageValidator {
    capability: Arc<dyn Capability>,
    query_timeout: Duration,
}

impl PageValidator {
    pub fn new(capability: Arc<dyn Capability>) -> Self {
        Self {
            capability,
            query_timeout: Duration::from_secs(15),
        }
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Validate the page currently shown at `url`.
    ///
    /// Capability errors are returned so the caller's retry wrapper can
    /// classify them; a failed check is a report, not an error.
    pub async fn validate(&self, url: &str, rules: &ValidationRules) -> CapabilityResult<ValidationReport> {
        if let Some(report) = check_url(url, rules) {
            tracing::debug!(target: LOG_TARGET, url, "url check failed");
            return Ok(report);
        }

        if rules.forbid_blank && self.ask(prompts::BLANK_PAGE).await? {
            return Ok(ValidationReport::fail(ValidationLayer::Perception, "page is blank"));
        }
        if self.ask(prompts::ERROR_PAGE).await? {
            return Ok(ValidationReport::fail(
                ValidationLayer::Perception,
                "page shows an error",
            ));
        }
        for assertion in &rules.assertions {
            if !self.ask(assertion).await? {
                return Ok(ValidationReport::fail(
                    ValidationLayer::Perception,
                    format!("assertion failed: {}", assertion),
                ));
            }
        }

        Ok(ValidationReport::pass())
    }

    async fn ask(&self, prompt: &str) -> CapabilityResult<bool> {
        bounded(self.query_timeout, self.capability.query_boolean(prompt)).await
    }
}

/// Layer 1: URL rules, no capability calls
fn check_url(url: &str, rules: &ValidationRules) -> Option<ValidationReport> {
    if url.is_empty() || url == "about:blank" {
        return Some(ValidationReport::fail(ValidationLayer::Url, "no page loaded"));
    }
    match &rules.url_contains {
        Some(fragment) if !url.contains(fragment.as_str()) => Some(ValidationReport::fail(
            ValidationLayer::Url,
            format!("url {} does not contain {}", url, fragment),
        )),
        _ => None,
    }
}
