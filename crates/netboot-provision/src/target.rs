use crate::config::ProvisionerConfig;
use crate::ProvisionError;
use async_trait::async_trait;
use netboot_store::TargetName;
use std::path::Path;
use std::sync::Arc;

/// Capability that exports a backing file as a network block-storage target.
///
/// Provisioning is two-phase: a backing store is attached for the file,
/// then the target (with its portal, LUN mapping and access grant) is
/// created on top of it. Teardown runs the phases in reverse. Callers own
/// ordering and rollback; implementations only report what happened.
#[async_trait]
pub trait TargetProvisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Phase (a): register `backing_path` as the backing store of `target`.
    async fn attach_backing_store(
        &self,
        target: &TargetName,
        backing_path: &Path,
    ) -> Result<(), ProvisionError>;

    /// Phase (b): create the target, its network portal and LUN mapping,
    /// and grant initiators access.
    async fn create_target(&self, target: &TargetName) -> Result<(), ProvisionError>;

    /// Reverse of phase (b). `NotFound` when the target does not exist.
    async fn delete_target(&self, target: &TargetName) -> Result<(), ProvisionError>;

    /// Reverse of phase (a). `NotFound` when nothing is attached.
    async fn detach_backing_store(&self, target: &TargetName) -> Result<(), ProvisionError>;

    async fn list_targets(&self) -> Result<Vec<TargetName>, ProvisionError>;

    async fn list_backing_stores(&self) -> Result<Vec<TargetName>, ProvisionError>;
}

pub fn select_provisioner(
    config: &ProvisionerConfig,
) -> Result<Arc<dyn TargetProvisioner>, ProvisionError> {
    match config.backend.as_str() {
        "targetcli" => Ok(Arc::new(crate::targetcli::TargetcliProvisioner::new(
            config.clone(),
        ))),
        "mock" => Ok(Arc::new(crate::mock::MockProvisioner::new())),
        other => Err(ProvisionError::BackendUnavailable(other.to_owned())),
    }
}
