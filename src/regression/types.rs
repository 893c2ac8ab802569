// Types for baseline comparisons

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::regression::key::ScreenshotKey;

/// Settings for the screenshot regression engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding `{key}.png` baselines
    pub baseline_dir: PathBuf,

    /// Directory receiving diff visualizations
    pub diff_dir: PathBuf,

    /// Captures match while the differing share stays under `threshold * 100` percent
    pub threshold: f64,

    /// Per-pixel colour distance threshold handed to the comparator
    pub pixel_threshold: f64,

    /// Overwrite baselines instead of comparing
    pub update_baseline: bool,

    /// Whether a mismatch fails the target
    pub fail_on_diff: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&crate::config::Config::defaults())
    }
}

impl From<&crate::config::Config> for EngineConfig {
    fn from(config: &crate::config::Config) -> Self {
        let s = &config.screenshot;
        Self {
            baseline_dir: s.baseline_dir.clone(),
            diff_dir: s.diff_dir.clone(),
            threshold: s.threshold,
            pixel_threshold: s.pixel_threshold,
            update_baseline: s.update_baseline,
            fail_on_diff: s.fail_on_diff,
        }
    }
}

impl EngineConfig {
    /// Baselines and diffs under one root directory
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            baseline_dir: root.join("baseline"),
            diff_dir: root.join("diff"),
            ..Default::default()
        }
    }

    pub fn update_baseline(mut self, update: bool) -> Self {
        self.update_baseline = update;
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn fail_on_diff(mut self, fail: bool) -> Self {
        self.fail_on_diff = fail;
        self
    }
}

/// Result of comparing a capture against its baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub diff_pixels: u64,
    pub total_pixels: u64,
    /// Rounded to two decimals
    pub diff_percentage: f64,
    /// Where the diff visualization was written, if any
    pub diff_image: Option<PathBuf>,
    pub dimension_mismatch: bool,
}

impl DiffResult {
    pub fn dimension_mismatch() -> Self {
        Self {
            is_match: false,
            diff_pixels: 0,
            total_pixels: 0,
            diff_percentage: 100.0,
            diff_image: None,
            dimension_mismatch: true,
        }
    }
}

/// Outcome of `compare_or_save_baseline`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ComparisonOutcome {
    /// The capture was stored as the baseline
    #[serde(rename_all = "camelCase")]
    Baseline {
        key: ScreenshotKey,
        path: PathBuf,
        is_new: bool,
    },

    /// The capture was compared against an existing baseline
    #[serde(rename_all = "camelCase")]
    Comparison {
        key: ScreenshotKey,
        baseline: PathBuf,
        #[serde(flatten)]
        result: DiffResult,
    },

    /// Comparison was inconclusive
    Error { key: ScreenshotKey, error: String },
}

impl ComparisonOutcome {
    pub fn key(&self) -> &ScreenshotKey {
        match self {
            ComparisonOutcome::Baseline { key, .. }
            | ComparisonOutcome::Comparison { key, .. }
            | ComparisonOutcome::Error { key, .. } => key,
        }
    }

    /// Whether this outcome should fail the target.
    ///
    /// New baselines and inconclusive comparisons never fail a target; a
    /// mismatch only does when `fail_on_diff` is set.
    pub fn fails_target(&self, fail_on_diff: bool) -> bool {
        match self {
            ComparisonOutcome::Comparison { result, .. } => fail_on_diff && !result.is_match,
            _ => false,
        }
    }

    /// File a session record can point at
    pub fn reference_path(&self) -> Option<&PathBuf> {
        match self {
            ComparisonOutcome::Baseline { path, .. } => Some(path),
            ComparisonOutcome::Comparison { result, baseline, .. } => {
                result.diff_image.as_ref().or(Some(baseline))
            }
            ComparisonOutcome::Error { .. } => None,
        }
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        match self {
            ComparisonOutcome::Baseline { key, is_new: true, .. } => {
                format!("{}: new baseline saved", key)
            }
            ComparisonOutcome::Baseline { key, .. } => format!("{}: baseline updated", key),
            ComparisonOutcome::Comparison { key, result, .. } if result.dimension_mismatch => {
                format!("{}: dimensions differ from baseline", key)
            }
            ComparisonOutcome::Comparison { key, result, .. } => format!(
                "{}: {} ({:.2}% of {} pixels differ)",
                key,
                if result.is_match { "match" } else { "MISMATCH" },
                result.diff_percentage,
                result.total_pixels
            ),
            ComparisonOutcome::Error { key, error } => format!("{}: comparison error: {}", key, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comparison(is_match: bool) -> ComparisonOutcome {
        ComparisonOutcome::Comparison {
            key: ScreenshotKey::from_label("reports"),
            baseline: PathBuf::from("baseline/reports.png"),
            result: DiffResult {
                is_match,
                diff_pixels: 5,
                total_pixels: 100,
                diff_percentage: 5.0,
                diff_image: None,
                dimension_mismatch: false,
            },
        }
    }

    #[test]
    fn test_fails_target_policy() {
        assert!(!comparison(false).fails_target(false));
        assert!(comparison(false).fails_target(true));
        assert!(!comparison(true).fails_target(true));

        let error = ComparisonOutcome::Error {
            key: ScreenshotKey::from_label("x"),
            error: "decode".to_string(),
        };
        assert!(!error.fails_target(true));
    }

    #[test]
    fn test_outcome_serializes_with_type_tag() {
        let value = serde_json::to_value(comparison(true)).unwrap();
        assert_eq!(value["type"], "comparison");
        assert_eq!(value["match"], true);
        assert_eq!(value["diffPixels"], 5);
        assert_eq!(value["dimensionMismatch"], false);

        let baseline = ComparisonOutcome::Baseline {
            key: ScreenshotKey::from_label("x"),
            path: PathBuf::from("x.png"),
            is_new: true,
        };
        let value = serde_json::to_value(baseline).unwrap();
        assert_eq!(value["type"], "baseline");
        assert_eq!(value["isNew"], true);
    }
}
