//! On-disk storage for derived bioacoustic artifacts
//!
//! Provides the chunked array store used for spectrograms, features and
//! projections, the human-inspectable segment sidecar files, and the
//! append-only registry index that maps (recording, stage, fingerprint)
//! to artifact locations.

pub mod format;
pub mod reader;
pub mod registry;
pub mod sidecar;
pub mod writer;

pub use format::{ArrayFile, ArrayHeader, ArrayRecord, StoreKind, MAGIC, VERSION};
pub use reader::ArrayReader;
pub use registry::{Registry, RegistryEntry, StageKey};
pub use sidecar::SegmentSidecar;
pub use writer::ArrayWriter;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store file failed structural or checksum verification.
    #[error("corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A record's data length disagrees with the declared record shape.
    #[error("record shape violation: {0}")]
    Shape(String),

    /// The registry refused to overwrite an already-published artifact.
    #[error("registry entry for {recording_id}/{stage}/{fingerprint} is immutable")]
    Immutable {
        recording_id: String,
        stage: String,
        fingerprint: String,
    },

    #[error("registry index error: {0}")]
    Index(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
