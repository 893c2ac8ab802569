//! Error types for menu regression runs

use thiserror::Error;

/// Result type alias using the crate error
pub type RegressResult<T> = Result<T, RegressError>;

/// Failure taxonomy shared by every component.
///
/// Only `SessionCorrupt` and `IllegalTransition` ever reach callers as `Err`
/// from the session state machine. The retry, navigation and regression
/// components convert their failures into structured outcomes instead.
#[derive(Error, Debug)]
pub enum RegressError {
    /// Resume snapshot is malformed, or the session was initialized twice
    #[error("session corrupt: {0}")]
    SessionCorrupt(String),

    /// A snapshot or cache write failed; in-memory state stays authoritative
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Every attempt of a retried operation failed
    #[error("retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Baseline and capture have different dimensions
    #[error("dimension mismatch: baseline {expected:?}, capture {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    /// Navigation left the owned domains and could not come back
    #[error("could not return inside boundary '{boundary}' from {url}")]
    CrossDomainReturnFailed { boundary: String, url: String },

    /// A status transition that would move a record backwards
    #[error("invalid state transition for {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}
