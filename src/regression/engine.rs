//! Baseline lifecycle and comparison.
//!
//! Storage layout:
//! - `baseline_dir/{key}.png`
//! - `diff_dir/{key}-diff-{timestamp}.png`, timestamp as ISO 8601 with `:` and `.` replaced by `-`
//!
//! The engine is the only writer of those paths. Baselines are written once
//! (or overwritten in update mode); diff images are never overwritten.

use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{RegressError, RegressResult};
use crate::regression::bitmap::Bitmap;
use crate::regression::diff::{DiffOptions, compare_pixels};
use crate::regression::key::ScreenshotKey;
use crate::regression::types::{ComparisonOutcome, DiffResult, EngineConfig};

const LOG_TARGET: &str = "menu_regress::regression";

/// Owns baseline and diff files for one run
#[derive(Debug, Clone)]
pub struct RegressionEngine {
    config: EngineConfig,
}

impl RegressionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn baseline_path(&self, key: &ScreenshotKey) -> PathBuf {
        self.config.baseline_dir.join(key.baseline_file_name())
    }

    pub fn has_baseline(&self, key: &ScreenshotKey) -> bool {
        self.baseline_path(key).is_file()
    }

    pub fn load_baseline(&self, key: &ScreenshotKey) -> RegressResult<Bitmap> {
        let bytes = fs::read(self.baseline_path(key))?;
        Bitmap::from_png_bytes(&bytes)
    }

    /// Save the capture as the baseline, or compare it against the existing one.
    ///
    /// Never fails: I/O and decode problems come back as
    /// [`ComparisonOutcome::Error`].
    pub fn compare_or_save_baseline(&self, key: &ScreenshotKey, capture: &[u8]) -> ComparisonOutcome {
        match self.try_compare_or_save(key, capture) {
            Ok(outcome) => {
                tracing::info!(target: LOG_TARGET, "{}", outcome.summary());
                outcome
            }
            Err(e) => {
                tracing::warn!(target: LOG_TARGET, key = %key, error = %e, "screenshot comparison inconclusive");
                ComparisonOutcome::Error {
                    key: key.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    fn try_compare_or_save(&self, key: &ScreenshotKey, capture: &[u8]) -> RegressResult<ComparisonOutcome> {
        let baseline_path = self.baseline_path(key);
        let exists = baseline_path.is_file();

        if self.config.update_baseline || !exists {
            // Reject undecodable captures before they become a baseline
            Bitmap::from_png_bytes(capture)?;
            fs::create_dir_all(&self.config.baseline_dir)?;
            fs::write(&baseline_path, capture)?;
            return Ok(ComparisonOutcome::Baseline {
                key: key.clone(),
                path: baseline_path,
                is_new: !exists,
            });
        }

        let baseline = Bitmap::from_png_bytes(&fs::read(&baseline_path)?)?;
        let actual = Bitmap::from_png_bytes(capture)?;

        if baseline.dimensions() != actual.dimensions() {
            tracing::debug!(
                target: LOG_TARGET,
                key = %key,
                expected = ?baseline.dimensions(),
                actual = ?actual.dimensions(),
                "dimension mismatch, skipping pixel comparison"
            );
            return Ok(ComparisonOutcome::Comparison {
                key: key.clone(),
                baseline: baseline_path,
                result: DiffResult::dimension_mismatch(),
            });
        }

        let result = self.compare_bitmaps(key, &baseline, &actual)?;
        Ok(ComparisonOutcome::Comparison {
            key: key.clone(),
            baseline: baseline_path,
            result,
        })
    }

    /// Compare two same-sized bitmaps, writing a diff image on mismatch
    pub fn compare_bitmaps(
        &self,
        key: &ScreenshotKey,
        expected: &Bitmap,
        actual: &Bitmap,
    ) -> RegressResult<DiffResult> {
        let options = DiffOptions::with_threshold(self.config.pixel_threshold);
        let diff = match compare_pixels(expected, actual, &options, true) {
            Ok(diff) => diff,
            Err(RegressError::DimensionMismatch { .. }) => return Ok(DiffResult::dimension_mismatch()),
            Err(e) => return Err(e),
        };

        let diff_percentage = diff.percentage();
        let is_match = diff.diff_pixels == 0 || diff_percentage < self.config.threshold * 100.0;

        let diff_image = match (&diff.image, is_match) {
            (Some(image), false) => Some(self.write_diff_image(key, image)?),
            _ => None,
        };

        Ok(DiffResult {
            is_match,
            diff_pixels: diff.diff_pixels,
            total_pixels: diff.total_pixels,
            diff_percentage,
            diff_image,
            dimension_mismatch: false,
        })
    }

    fn write_diff_image(&self, key: &ScreenshotKey, image: &Bitmap) -> RegressResult<PathBuf> {
        fs::create_dir_all(&self.config.diff_dir)?;
        let path = unique_path(&self.config.diff_dir, &diff_file_stem(key));
        fs::write(&path, image.to_png()?)?;
        Ok(path)
    }

    /// List the keys that currently have a baseline
    pub fn list_baselines(&self) -> RegressResult<Vec<ScreenshotKey>> {
        let mut keys = Vec::new();
        if !self.config.baseline_dir.exists() {
            return Ok(keys);
        }
        for entry in fs::read_dir(&self.config.baseline_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "png").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    keys.push(ScreenshotKey::from_stem(&stem.to_string_lossy()));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove diff images older than `max_age`. Baselines are never touched.
    pub fn clean_old_diffs(&self, max_age: Duration) -> RegressResult<usize> {
        let dir = &self.config.diff_dir;
        if !dir.exists() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut cleaned = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().map(|e| e != "png").unwrap_or(true) {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if let Some(age) = age {
                if age > max_age && fs::remove_file(&path).is_ok() {
                    cleaned += 1;
                }
            }
        }

        Ok(cleaned)
    }
}

/// `{key}-diff-{timestamp}` with `:` and `.` replaced by `-`
fn diff_file_stem(key: &ScreenshotKey) -> String {
    let timestamp = Utc::now()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}-diff-{}", key, timestamp)
}

/// First `{stem}.png`, `{stem}-1.png`, ... that does not exist yet
fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let candidate = dir.join(format!("{}.png", stem));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{}-{}.png", stem, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_file_stem_format() {
        let stem = diff_file_stem(&ScreenshotKey::from_label("chain-reports"));
        assert!(stem.starts_with("chain-reports-diff-"));
        let timestamp = stem.trim_start_matches("chain-reports-diff-");
        assert!(!timestamp.contains(':'));
        assert!(!timestamp.contains('.'));
        assert!(timestamp.ends_with('Z'));
    }

    #[test]
    fn test_unique_path_never_reuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "k-diff-t");
        fs::write(&first, b"x").unwrap();
        let second = unique_path(dir.path(), "k-diff-t");
        assert_ne!(first, second);
        assert!(second.ends_with("k-diff-t-1.png"));
    }
}
