use crate::command::run_tool;
use crate::config::ProvisionerConfig;
use crate::target::TargetProvisioner;
use crate::ProvisionError;
use async_trait::async_trait;
use netboot_store::TargetName;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// iSCSI targets on the Linux LIO stack, driven through `targetcli`.
///
/// Each target gets a `fileio` backstore named after the target and one
/// TPG with a single LUN. Access is granted with generated node ACLs,
/// since initiator names are not known before the machine boots. Listing
/// reads configfs directly instead of scraping `targetcli ls` output.
/// IQNs are lowercase, so listed target names come back lowercased.
pub struct TargetcliProvisioner {
    config: ProvisionerConfig,
}

impl TargetcliProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    pub fn iqn(&self, target: &TargetName) -> String {
        format!("{}:{}", self.config.iqn_prefix, target.to_ascii_lowercase())
    }

    fn target_from_iqn(&self, iqn: &str) -> Option<TargetName> {
        iqn.strip_prefix(&self.config.iqn_prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|rest| !rest.is_empty())
            .map(TargetName::from)
    }

    fn portal(&self) -> (&str, &str) {
        self.config
            .portal
            .rsplit_once(':')
            .unwrap_or((self.config.portal.as_str(), "3260"))
    }

    async fn targetcli(&self, args: &[String]) -> Result<(), ProvisionError> {
        run_tool(&self.config.command, args, self.config.command_timeout()).await?;
        Ok(())
    }

    async fn build_target(&self, iqn: &str, target: &TargetName) -> Result<(), ProvisionError> {
        let tpg = format!("/iscsi/{iqn}/tpg1");
        self.targetcli(&[
            format!("{tpg}/luns"),
            "create".to_owned(),
            format!("/backstores/fileio/{target}"),
        ])
        .await?;

        let (ip, port) = self.portal();
        match self
            .targetcli(&[
                format!("{tpg}/portals"),
                "create".to_owned(),
                ip.to_owned(),
                port.to_owned(),
            ])
            .await
        {
            // targetcli creates a default 0.0.0.0:3260 portal with the target.
            Ok(()) | Err(ProvisionError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        self.targetcli(&[
            tpg,
            "set".to_owned(),
            "attribute".to_owned(),
            "authentication=0".to_owned(),
            "generate_node_acls=1".to_owned(),
            "demo_mode_write_protect=0".to_owned(),
        ])
        .await
    }

    fn list_dir_names(dir: &Path) -> Result<Vec<String>, ProvisionError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl TargetProvisioner for TargetcliProvisioner {
    fn name(&self) -> &'static str {
        "targetcli"
    }

    async fn attach_backing_store(
        &self,
        target: &TargetName,
        backing_path: &Path,
    ) -> Result<(), ProvisionError> {
        if !backing_path.is_file() {
            return Err(ProvisionError::Permanent(format!(
                "backing file {} does not exist or is not a regular file",
                backing_path.display()
            )));
        }
        info!(
            "attaching backing store {target} -> {}",
            backing_path.display()
        );
        self.targetcli(&[
            "/backstores/fileio".to_owned(),
            "create".to_owned(),
            format!("name={target}"),
            format!("file_or_dev={}", backing_path.display()),
        ])
        .await
    }

    async fn create_target(&self, target: &TargetName) -> Result<(), ProvisionError> {
        let iqn = self.iqn(target);
        info!("creating iSCSI target {iqn}");
        match self
            .targetcli(&["/iscsi".to_owned(), "create".to_owned(), iqn.clone()])
            .await
        {
            Ok(()) | Err(ProvisionError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        // Phase (b) is all-or-nothing: a half-built target is removed here so
        // the caller only has the backing store left to roll back.
        if let Err(e) = self.build_target(&iqn, target).await {
            warn!("target {iqn} setup failed, removing partial target: {e}");
            if let Err(cleanup) = self
                .targetcli(&["/iscsi".to_owned(), "delete".to_owned(), iqn.clone()])
                .await
            {
                warn!("removing partial target {iqn} failed: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn delete_target(&self, target: &TargetName) -> Result<(), ProvisionError> {
        let iqn = self.iqn(target);
        debug!("deleting iSCSI target {iqn}");
        self.targetcli(&["/iscsi".to_owned(), "delete".to_owned(), iqn])
            .await
    }

    async fn detach_backing_store(&self, target: &TargetName) -> Result<(), ProvisionError> {
        debug!("detaching backing store {target}");
        self.targetcli(&[
            "/backstores/fileio".to_owned(),
            "delete".to_owned(),
            target.to_string(),
        ])
        .await
    }

    async fn list_targets(&self) -> Result<Vec<TargetName>, ProvisionError> {
        let dir = self.config.configfs_root.join("iscsi");
        Ok(Self::list_dir_names(&dir)?
            .iter()
            .filter_map(|iqn| self.target_from_iqn(iqn))
            .collect())
    }

    async fn list_backing_stores(&self) -> Result<Vec<TargetName>, ProvisionError> {
        let core = self.config.configfs_root.join("core");
        let mut stores = Vec::new();
        for hba in Self::list_dir_names(&core)? {
            if hba.starts_with("fileio_") {
                let hba_dir: PathBuf = core.join(&hba);
                stores.extend(
                    Self::list_dir_names(&hba_dir)?
                        .into_iter()
                        .map(TargetName::from),
                );
            }
        }
        stores.sort();
        Ok(stores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn provisioner(configfs: &Path) -> TargetcliProvisioner {
        TargetcliProvisioner::new(ProvisionerConfig {
            configfs_root: configfs.to_path_buf(),
            ..ProvisionerConfig::default()
        })
    }

    #[test]
    fn iqn_roundtrip() {
        let p = provisioner(Path::new("/nonexistent"));
        let name = TargetName::new("m1-win11-base");
        let iqn = p.iqn(&name);
        assert_eq!(iqn, "iqn.2024-01.org.netboot:m1-win11-base");
        assert_eq!(p.target_from_iqn(&iqn), Some(name));
        assert_eq!(p.target_from_iqn("iqn.2003-01.other:disk"), None);
    }

    #[test]
    fn portal_parsing() {
        let p = TargetcliProvisioner::new(ProvisionerConfig {
            portal: "10.0.0.5:3261".to_owned(),
            ..ProvisionerConfig::default()
        });
        assert_eq!(p.portal(), ("10.0.0.5", "3261"));
    }

    #[tokio::test]
    async fn lists_from_configfs_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("iscsi/iqn.2024-01.org.netboot:m1-ubuntu")).unwrap();
        fs::create_dir_all(root.join("iscsi/iqn.2003-01.org.linux-iscsi.foreign:x")).unwrap();
        fs::create_dir_all(root.join("core/fileio_0/M1-ubuntu")).unwrap();
        fs::create_dir_all(root.join("core/iblock_0/sda")).unwrap();

        let p = provisioner(root);
        assert_eq!(
            p.list_targets().await.unwrap(),
            vec![TargetName::new("m1-ubuntu")]
        );
        assert_eq!(
            p.list_backing_stores().await.unwrap(),
            vec![TargetName::new("M1-ubuntu")]
        );
    }

    #[tokio::test]
    async fn missing_configfs_lists_nothing() {
        let p = provisioner(Path::new("/nonexistent/configfs"));
        assert!(p.list_targets().await.unwrap().is_empty());
        assert!(p.list_backing_stores().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn attach_rejects_missing_backing_file() {
        let p = provisioner(Path::new("/nonexistent"));
        let err = p
            .attach_backing_store(&"M1-ubuntu".into(), Path::new("/nonexistent/disk.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Permanent(_)));
    }
}
