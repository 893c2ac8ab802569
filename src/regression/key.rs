//! Deterministic screenshot key derivation.
//!
//! A key names the baseline file of one subject (and scenario), so the same
//! page must always map to the same key regardless of trailing slashes,
//! doubled separators, query strings or fragment queries.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Key used when every character of the subject was stripped
pub const EMPTY_KEY: &str = "home";

/// Scenario name that adds no suffix
pub const DEFAULT_SCENARIO: &str = "default";

/// Scenario keys are cut to this many characters
pub const MAX_SCENARIO_LEN: usize = 50;

/// Derived name of a baseline
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreenshotKey(String);

impl ScreenshotKey {
    /// Derive a key from a URL (preferred) or a fallback text label.
    ///
    /// A URL that does not parse is ignored in favour of the label.
    pub fn derive(url: Option<&str>, label: &str, scenario: Option<&str>) -> Self {
        let base = url
            .and_then(key_from_url)
            .unwrap_or_else(|| sanitize_label(label));

        match scenario.and_then(scenario_key) {
            Some(suffix) => Self(format!("{}-{}", base, suffix)),
            None => Self(base),
        }
    }

    /// Accept a caller-supplied key, normalizing it into the key alphabet
    pub fn from_label(label: &str) -> Self {
        Self(sanitize_label(label))
    }

    /// Key of an existing baseline file, taken as-is from its stem
    pub fn from_stem(stem: &str) -> Self {
        Self(stem.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Baseline file name (`{key}.png`)
    pub fn baseline_file_name(&self) -> String {
        format!("{}.png", self.0)
    }
}

impl fmt::Display for ScreenshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScreenshotKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a URL into its screenshot key; unparseable input yields [`EMPTY_KEY`]
pub fn normalize_key(url: &str) -> String {
    key_from_url(url).unwrap_or_else(|| EMPTY_KEY.to_string())
}

/// Path and fragment of a URL, flattened into a key
fn key_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;

    let mut pathname = collapse_repeats(parsed.path(), '/');
    if pathname.len() > 1 && pathname.ends_with('/') {
        pathname.pop();
    }
    if pathname.is_empty() {
        pathname.push('/');
    }

    let hash = match parsed.fragment() {
        Some(fragment) if !fragment.is_empty() => {
            let fragment = fragment.split('?').next().unwrap_or_default();
            format!("#{}", fragment)
        }
        _ => String::new(),
    };

    Some(flatten_path(&format!("{}{}", pathname, hash)))
}

fn flatten_path(full_path: &str) -> String {
    let replaced: String = full_path
        .trim_start_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '#' | '?' | '&' | '=' | '.' => '-',
            other => other,
        })
        .collect();
    finish(&replaced)
}

/// Reduce free text to the key alphabet: alphanumerics kept, everything else `-`
fn sanitize_label(label: &str) -> String {
    let replaced: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    finish(&replaced)
}

fn scenario_key(scenario: &str) -> Option<String> {
    let trimmed = scenario.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(DEFAULT_SCENARIO) {
        return None;
    }
    let replaced: String = trimmed
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let key: String = squash(&replaced).chars().take(MAX_SCENARIO_LEN).collect();
    let key = key.trim_matches('-');
    (!key.is_empty()).then(|| key.to_string())
}

/// Collapse `-` runs, trim `-`, lowercase, substitute [`EMPTY_KEY`] for nothing
fn finish(raw: &str) -> String {
    let key = squash(raw);
    if key.is_empty() {
        EMPTY_KEY.to_string()
    } else {
        key
    }
}

fn squash(raw: &str) -> String {
    collapse_repeats(raw, '-').trim_matches('-').to_lowercase()
}

fn collapse_repeats(input: &str, ch: char) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous = None;
    for c in input.chars() {
        if c == ch && previous == Some(ch) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}
