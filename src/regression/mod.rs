pub mod bitmap;
pub mod diff;
pub mod engine;
pub mod key;
pub mod types;

pub use bitmap::Bitmap;
pub use diff::{DiffOptions, PixelDiff, compare_pixels};
pub use engine::RegressionEngine;
pub use key::{ScreenshotKey, normalize_key};
pub use types::{ComparisonOutcome, DiffResult, EngineConfig};
