//! Records and persisted state for the netboot orchestrator.
//!
//! This crate provides the storage layer: typed identifiers, the `Machine`,
//! `Image`, `ConversionJob`, `Target` and `Session` records with their state
//! enums, the in-memory `Tables` arena keyed by surrogate id, and `Store`,
//! which funnels every mutation through one transaction that is persisted as
//! an atomically replaced, checksummed JSON snapshot.

pub mod layout;
pub mod records;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use layout::{StateLayout, STATE_FORMAT_VERSION};
pub use records::{
    BootStage, ConversionJob, Image, ImageFormat, ImageState, JobState, Machine, MachineState,
    Session, SessionState, Target, TargetState,
};
pub use snapshot::SnapshotFile;
pub use store::Store;
pub use tables::Tables;
pub use types::{
    validate_image_name, validate_machine_id, ImageId, JobId, MachineId, SessionId, TargetName,
};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{what}': expected {expected}, got {actual}")]
    IntegrityFailure {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("record is immutable: {0}")]
    Immutable(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
