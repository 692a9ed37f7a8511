//! Error taxonomy for the processing pipeline

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Audio could not be read or decoded. Fatal for the recording; batch
    /// mode isolates it and reports it in the run summary.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A recognized parameter holds a value outside its documented range.
    /// Never silently replaced with a default.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A parameter key is not part of the stage's recognized option set.
    /// Rejected up front so a typo'd option can never produce a false
    /// cache hit.
    #[error("unrecognized parameter: {0}")]
    UnrecognizedParameter(String),

    /// A derived array disagrees with its declared shape.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A per-segment field is misaligned with its defining segment set.
    /// Surfaced immediately; never auto-repaired.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A cached artifact failed verification. The artifact is retracted and
    /// recomputed; the error surfaces only if recomputation is impossible.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    #[error(transparent)]
    Store(#[from] syrinx_store::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
