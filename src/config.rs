//! Configuration management with environment variable support.
//!
//! Holds every knob the regression core consumes. Values come from
//! environment variables, falling back to defaults; the CLI layers its
//! flags on top.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MENU_REGRESS_THRESHOLD` | Mismatch ratio (0-1) under which a capture still matches | `0.1` |
//! | `MENU_REGRESS_PIXEL_THRESHOLD` | Per-pixel colour distance threshold (0-1) | `0.1` |
//! | `MENU_REGRESS_BASELINE_DIR` | Baseline screenshot directory | `./screenshots/baseline` |
//! | `MENU_REGRESS_DIFF_DIR` | Diff image directory | `./screenshots/diff` |
//! | `MENU_REGRESS_UPDATE_BASELINE` | Overwrite baselines with new captures | `false` |
//! | `MENU_REGRESS_FAIL_ON_DIFF` | Fail a target when its screenshot differs | `false` |
//! | `MENU_REGRESS_MAX_RETRIES` | Retries after the first attempt | `2` |
//! | `MENU_REGRESS_RETRY_BACKOFF_MS` | Fixed wait between attempts | `1000` |
//! | `MENU_REGRESS_DOMAIN_PATTERNS` | Comma-separated owned URL substrings | empty |
//! | `MENU_REGRESS_ANCHOR_URL` | URL used to return inside the boundary | unset |
//! | `MENU_REGRESS_MAX_RETURN_ATTEMPTS` | Bound on boundary return attempts | `2` |
//! | `MENU_REGRESS_CACHE_MAX_AGE_MS` | Route cache lifetime | `86400000` |
//! | `MENU_REGRESS_CACHE_PATH` | Route cache file | `./.menu-cache.json` |
//! | `MENU_REGRESS_SESSION_DIR` | Session snapshot directory | `./.sessions` |

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Default Values
// ============================================================================

pub const DEFAULT_THRESHOLD: f64 = 0.1;
pub const DEFAULT_PIXEL_THRESHOLD: f64 = 0.1;
pub const DEFAULT_BASELINE_DIR: &str = "./screenshots/baseline";
pub const DEFAULT_DIFF_DIR: &str = "./screenshots/diff";
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_MAX_RETURN_ATTEMPTS: u32 = 2;

/// Route cache lifetime (24 hours)
pub const DEFAULT_CACHE_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

pub const DEFAULT_CACHE_PATH: &str = "./.menu-cache.json";
pub const DEFAULT_SESSION_DIR: &str = "./.sessions";

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_THRESHOLD: &str = "MENU_REGRESS_THRESHOLD";
pub const ENV_PIXEL_THRESHOLD: &str = "MENU_REGRESS_PIXEL_THRESHOLD";
pub const ENV_BASELINE_DIR: &str = "MENU_REGRESS_BASELINE_DIR";
pub const ENV_DIFF_DIR: &str = "MENU_REGRESS_DIFF_DIR";
pub const ENV_UPDATE_BASELINE: &str = "MENU_REGRESS_UPDATE_BASELINE";
pub const ENV_FAIL_ON_DIFF: &str = "MENU_REGRESS_FAIL_ON_DIFF";
pub const ENV_MAX_RETRIES: &str = "MENU_REGRESS_MAX_RETRIES";
pub const ENV_RETRY_BACKOFF_MS: &str = "MENU_REGRESS_RETRY_BACKOFF_MS";
pub const ENV_DOMAIN_PATTERNS: &str = "MENU_REGRESS_DOMAIN_PATTERNS";
pub const ENV_ANCHOR_URL: &str = "MENU_REGRESS_ANCHOR_URL";
pub const ENV_MAX_RETURN_ATTEMPTS: &str = "MENU_REGRESS_MAX_RETURN_ATTEMPTS";
pub const ENV_CACHE_MAX_AGE_MS: &str = "MENU_REGRESS_CACHE_MAX_AGE_MS";
pub const ENV_CACHE_PATH: &str = "MENU_REGRESS_CACHE_PATH";
pub const ENV_SESSION_DIR: &str = "MENU_REGRESS_SESSION_DIR";

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the process-wide configuration (initialized from environment on first access).
///
/// Only the binary's composition root should call this; library components
/// receive their settings through constructors.
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration for a regression run
#[derive(Debug, Clone)]
pub struct Config {
    /// Screenshot comparison settings
    pub screenshot: ScreenshotSettings,
    /// Retry settings
    pub retry: RetrySettings,
    /// Domain boundary settings
    pub boundary: BoundarySettings,
    /// Persistence locations
    pub storage: StorageSettings,
}

/// Screenshot comparison settings
#[derive(Debug, Clone)]
pub struct ScreenshotSettings {
    pub threshold: f64,
    pub pixel_threshold: f64,
    pub baseline_dir: PathBuf,
    pub diff_dir: PathBuf,
    pub update_baseline: bool,
    pub fail_on_diff: bool,
}

/// Retry settings
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed wait between attempts
    pub backoff_ms: u64,
}

/// Domain boundary settings
#[derive(Debug, Clone)]
pub struct BoundarySettings {
    pub domain_patterns: Vec<String>,
    pub anchor_url: Option<String>,
    pub max_return_attempts: u32,
}

/// Where sessions and the route cache live
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub session_dir: PathBuf,
    pub cache_path: PathBuf,
    pub cache_max_age_ms: u64,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            screenshot: ScreenshotSettings::from_env(),
            retry: RetrySettings::from_env(),
            boundary: BoundarySettings::from_env(),
            storage: StorageSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            screenshot: ScreenshotSettings::defaults(),
            retry: RetrySettings::defaults(),
            boundary: BoundarySettings::defaults(),
            storage: StorageSettings::defaults(),
        }
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_millis(self.storage.cache_max_age_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ScreenshotSettings {
    pub fn from_env() -> Self {
        Self {
            threshold: env_ratio(ENV_THRESHOLD).unwrap_or(DEFAULT_THRESHOLD),
            pixel_threshold: env_ratio(ENV_PIXEL_THRESHOLD).unwrap_or(DEFAULT_PIXEL_THRESHOLD),
            baseline_dir: env::var(ENV_BASELINE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_BASELINE_DIR)),
            diff_dir: env::var(ENV_DIFF_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DIFF_DIR)),
            update_baseline: env_flag(ENV_UPDATE_BASELINE).unwrap_or(false),
            fail_on_diff: env_flag(ENV_FAIL_ON_DIFF).unwrap_or(false),
        }
    }

    pub fn defaults() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            pixel_threshold: DEFAULT_PIXEL_THRESHOLD,
            baseline_dir: PathBuf::from(DEFAULT_BASELINE_DIR),
            diff_dir: PathBuf::from(DEFAULT_DIFF_DIR),
            update_baseline: false,
            fail_on_diff: false,
        }
    }
}

impl RetrySettings {
    pub fn from_env() -> Self {
        Self {
            max_retries: env_parse(ENV_MAX_RETRIES).unwrap_or(DEFAULT_MAX_RETRIES),
            backoff_ms: env_parse(ENV_RETRY_BACKOFF_MS).unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl BoundarySettings {
    pub fn from_env() -> Self {
        Self {
            domain_patterns: env::var(ENV_DOMAIN_PATTERNS)
                .map(|s| parse_patterns(&s))
                .unwrap_or_default(),
            anchor_url: env::var(ENV_ANCHOR_URL).ok().filter(|s| !s.trim().is_empty()),
            max_return_attempts: env_parse(ENV_MAX_RETURN_ATTEMPTS)
                .unwrap_or(DEFAULT_MAX_RETURN_ATTEMPTS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            domain_patterns: Vec::new(),
            anchor_url: None,
            max_return_attempts: DEFAULT_MAX_RETURN_ATTEMPTS,
        }
    }
}

impl StorageSettings {
    pub fn from_env() -> Self {
        Self {
            session_dir: env::var(ENV_SESSION_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SESSION_DIR)),
            cache_path: env::var(ENV_CACHE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_PATH)),
            cache_max_age_ms: env_parse(ENV_CACHE_MAX_AGE_MS).unwrap_or(DEFAULT_CACHE_MAX_AGE_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            session_dir: PathBuf::from(DEFAULT_SESSION_DIR),
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            cache_max_age_ms: DEFAULT_CACHE_MAX_AGE_MS,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_flag(&s))
}

fn env_ratio(name: &str) -> Option<f64> {
    env_parse::<f64>(name).filter(|v| (0.0..=1.0).contains(v))
}

/// Parse a boolean flag: "1", "true", "yes", "on" and their negatives
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated pattern list, dropping blanks
pub fn parse_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag(" YES "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            parse_patterns("app.example.com, ,admin.example.com,"),
            vec!["app.example.com".to_string(), "admin.example.com".to_string()]
        );
        assert!(parse_patterns("").is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.screenshot.threshold, DEFAULT_THRESHOLD);
        assert_eq!(config.retry.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.boundary.max_return_attempts, 2);
        assert_eq!(config.cache_max_age(), Duration::from_secs(24 * 60 * 60));
        assert!(!config.screenshot.update_baseline);
    }
}
