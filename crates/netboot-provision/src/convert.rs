use crate::config::ConverterConfig;
use crate::ProvisionError;
use async_trait::async_trait;
use netboot_store::{ImageFormat, ImageId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionRequest {
    pub image_id: ImageId,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversionOutcome {
    Running,
    Succeeded,
    Failed,
}

/// What a converter reports for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionStatus {
    pub outcome: ConversionOutcome,
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
    /// Only meaningful for `Failed`: whether a fresh invocation may succeed.
    #[serde(default)]
    pub transient: bool,
}

impl ConversionStatus {
    pub fn running(progress: u8) -> Self {
        Self {
            outcome: ConversionOutcome::Running,
            progress: progress.min(100),
            error: None,
            transient: false,
        }
    }

    pub fn succeeded() -> Self {
        Self {
            outcome: ConversionOutcome::Succeeded,
            progress: 100,
            error: None,
            transient: false,
        }
    }

    pub fn failed(progress: u8, error: impl Into<String>, transient: bool) -> Self {
        Self {
            outcome: ConversionOutcome::Failed,
            progress: progress.min(100),
            error: Some(error.into()),
            transient,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != ConversionOutcome::Running
    }
}

/// Capability that converts an uploaded disk image into the export format.
///
/// `submit` starts one invocation and returns the converter's own handle
/// for it; `poll` reports progress until the invocation settles. Progress
/// must not decrease and a terminal status must not change once reported.
/// A converter may forget a handle after reporting its terminal status.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, request: &ConversionRequest) -> Result<String, ProvisionError>;

    async fn poll(&self, handle: &str) -> Result<ConversionStatus, ProvisionError>;
}

pub fn select_converter(
    config: &ConverterConfig,
) -> Result<Arc<dyn ImageConverter>, ProvisionError> {
    match config.backend.as_str() {
        "qemu-img" => Ok(Arc::new(crate::qemu::QemuImgConverter::new(config.clone()))),
        "mock" => Ok(Arc::new(crate::mock::MockConverter::new())),
        other => Err(ProvisionError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_constructors() {
        assert!(!ConversionStatus::running(40).is_terminal());
        assert_eq!(ConversionStatus::running(140).progress, 100);
        let ok = ConversionStatus::succeeded();
        assert!(ok.is_terminal());
        assert_eq!(ok.progress, 100);
        let failed = ConversionStatus::failed(12, "disk full", false);
        assert!(failed.is_terminal());
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert!(!failed.transient);
    }

    #[test]
    fn select_converter_backends() {
        assert_eq!(
            select_converter(&ConverterConfig::default()).unwrap().name(),
            "qemu-img"
        );
        assert_eq!(
            select_converter(&ConverterConfig::mock()).unwrap().name(),
            "mock"
        );
        let bogus = ConverterConfig {
            backend: "vboxmanage".to_owned(),
            ..ConverterConfig::default()
        };
        assert!(select_converter(&bogus).is_err());
    }
}
