//! External capabilities driven by the netboot orchestrator.
//!
//! This crate implements the edge of the system: the `TargetProvisioner`
//! trait for exporting a backing file as a network block-storage target, the
//! `ImageConverter` trait for asynchronous disk-image format conversion, the
//! real adapters (`targetcli` over LIO configfs, `qemu-img`), in-memory mocks
//! with fault injection for tests, prerequisite checks, and the error
//! classification (transient / permanent / not found) callers retry on.

pub mod command;
pub mod config;
pub mod convert;
pub mod mock;
pub mod prereq;
pub mod qemu;
pub mod target;
pub mod targetcli;

pub use config::{ConverterConfig, ProvisionerConfig};
pub use convert::{
    select_converter, ConversionOutcome, ConversionRequest, ConversionStatus, ImageConverter,
};
pub use mock::{Fault, MockConverter, MockOp, MockOutcome, MockProvisioner};
pub use prereq::{check_converter_prereqs, check_provisioner_prereqs, format_missing, MissingPrereq};
pub use target::{select_provisioner, TargetProvisioner};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl ProvisionError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Transient(_) => true,
            ProvisionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
    }
}
