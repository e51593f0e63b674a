//! Boot session orchestration for diskless network-booted machines.
//!
//! This crate ties the record store and the external capabilities together:
//! the `MachineRegistry` tracks boot-stage reports and liveness, the
//! `ImageCatalog` and `JobTracker` take uploaded images through conversion
//! and verification, the `TargetManager` provisions and tears down storage
//! targets idempotently, and the `Orchestrator` drives boot sessions through
//! their lifecycle with per-machine leases, retries and rollback. Every state
//! change is published on the `EventPublisher`.

pub mod catalog;
pub mod concurrency;
pub mod config;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod targets;

pub use catalog::{checksum_file, ImageCatalog, ImageSpec};
pub use concurrency::{
    install_signal_handler, shutdown_requested, MachineLease, MachineLeases, StateLock,
};
pub use config::{NetbootConfig, RetryConfig, ServerConfig, DEFAULT_CONFIG_PATH};
pub use events::{EntityKind, EventPublisher, StatusEvent};
pub use jobs::JobTracker;
pub use lifecycle::{
    machine_transitions, validate_image_transition, validate_job_transition,
    validate_session_transition,
};
pub use orchestrator::{Orchestrator, RecoveryReport};
pub use registry::MachineRegistry;
pub use retry::RetryPolicy;
pub use targets::{ReconcileReport, TargetManager};

use netboot_provision::ProvisionError;
use netboot_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("transient provisioning failure: {0}")]
    TransientProvisioning(String),
    #[error("provisioning failed after {attempts} attempt(s): {last_error}")]
    PermanentProvisioning { attempts: u32, last_error: String },
    #[error("conversion failed: {0}")]
    ConversionFailure(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the owning component may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientProvisioning(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            StoreError::InvalidName(msg) | StoreError::InvalidValue(msg) => {
                CoreError::Validation(msg)
            }
            other => CoreError::Store(other),
        }
    }
}

impl From<ProvisionError> for CoreError {
    fn from(e: ProvisionError) -> Self {
        if e.is_transient() {
            CoreError::TransientProvisioning(e.to_string())
        } else {
            CoreError::PermanentProvisioning {
                attempts: 1,
                last_error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_caller_facing_classes() {
        let e: CoreError = StoreError::NotFound("machine 'M1'".to_owned()).into();
        assert!(matches!(e, CoreError::NotFound(_)));
        let e: CoreError = StoreError::InvalidName("bad".to_owned()).into();
        assert!(matches!(e, CoreError::Validation(_)));
        let e: CoreError = StoreError::LockFailed("poisoned".to_owned()).into();
        assert!(matches!(e, CoreError::Store(_)));
    }

    #[test]
    fn provision_errors_keep_their_class() {
        let e: CoreError = ProvisionError::Transient("busy".to_owned()).into();
        assert!(e.is_transient());
        let e: CoreError = ProvisionError::Permanent("bad path".to_owned()).into();
        assert!(matches!(
            e,
            CoreError::PermanentProvisioning { attempts: 1, .. }
        ));
        assert!(!e.is_transient());
    }
}
