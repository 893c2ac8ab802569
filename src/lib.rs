//! Menu Regress - navigation menu regression testing.
//!
//! This crate provides:
//! - A persisted, resumable run state machine (`session`)
//! - Bounded retries with failure-kind specific recovery (`retry`)
//! - Detection of and recovery from navigation leaving the owned domains (`navigation`)
//! - Deterministic screenshot keys, baseline management and pixel diffing (`regression`)
//! - A route cache so menus need not be rediscovered every run (`cache`)
//!
//! Browser control and page understanding are not implemented here; they
//! are reached through the [`Capability`] trait.
//!
//! # Example
//!
//! ```rust,no_run
//! use menu_regress::regression::{EngineConfig, RegressionEngine, ScreenshotKey};
//!
//! let engine = RegressionEngine::new(EngineConfig::in_dir("./screenshots"));
//! let key = ScreenshotKey::derive(Some("https://a.com/chain//reports/"), "Reports", None);
//! let capture = std::fs::read("capture.png").unwrap();
//! println!("{}", engine.compare_or_save_baseline(&key, &capture).summary());
//! ```

pub mod cache;
pub mod capability;
pub mod config;
pub mod error;
pub mod navigation;
pub mod regression;
pub mod retry;
pub mod runner;
pub mod session;
pub mod validate;

// Re-export error types
pub use error::{RegressError, RegressResult};

// Re-export the capability boundary
pub use capability::{Capability, CapabilityError, CapabilityResponse, CapabilityResult, MockBrowser, MockPage};

// Re-export core components
pub use cache::{RouteCacheStore, RouteEntry, normalize_url};
pub use navigation::{BoundaryPolicy, NavigationOutcome, NavigationRecoveryManager, is_cross_boundary};
pub use regression::{
    Bitmap, ComparisonOutcome, DiffResult, EngineConfig, RegressionEngine, ScreenshotKey, normalize_key,
};
pub use retry::{FailureKind, RetryClassifier, RetryContext, RetryOutcome, RetryPolicy};
pub use session::{
    FileSnapshotStore, SessionStateMachine, SnapshotStore, TargetDescriptor, TargetResult, TargetStatus,
    TestSession,
};
pub use validate::{PageValidator, ValidationReport, ValidationRules};

// Re-export the orchestrator
pub use runner::{RunOptions, RunResult, Runner, TargetOutcome};
