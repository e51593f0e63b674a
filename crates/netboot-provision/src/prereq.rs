use crate::config::{ConverterConfig, ProvisionerConfig};
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check what the configured provisioner backend needs on this host.
/// The mock backend needs nothing.
pub fn check_provisioner_prereqs(config: &ProvisionerConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if config.backend != "targetcli" {
        return missing;
    }

    if !command_exists(&config.command) {
        missing.push(MissingPrereq {
            name: config.command.clone(),
            purpose: "creating iSCSI targets",
            install_hint: "zypper install targetcli-fb | apt install targetcli-fb | dnf install targetcli",
        });
    }

    if !config.configfs_root.is_dir() {
        missing.push(MissingPrereq {
            name: config.configfs_root.display().to_string(),
            purpose: "LIO target configfs tree",
            install_hint: "modprobe target_core_mod iscsi_target_mod (configfs mounted at /sys/kernel/config)",
        });
    }

    missing
}

/// Check what the configured converter backend needs on this host.
pub fn check_converter_prereqs(config: &ConverterConfig) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if config.backend == "qemu-img" && !command_exists(&config.command) {
        missing.push(MissingPrereq {
            name: config.command.clone(),
            purpose: "converting uploaded disk images",
            install_hint:
                "zypper install qemu-tools | apt install qemu-utils | dnf install qemu-img | pacman -S qemu-img",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nnetboot needs these to export images to booting machines.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "qemu-img".to_owned(),
            purpose: "converting images",
            install_hint: "apt install qemu-utils",
        };
        let s = format!("{m}");
        assert!(s.contains("qemu-img"));
        assert!(s.contains("converting images"));
        assert!(s.contains("apt install qemu-utils"));
    }

    #[test]
    fn mock_backends_need_nothing() {
        assert!(check_provisioner_prereqs(&ProvisionerConfig::mock()).is_empty());
        assert!(check_converter_prereqs(&ConverterConfig::mock()).is_empty());
    }

    #[test]
    fn reports_missing_tools_and_configfs() {
        let config = ProvisionerConfig {
            command: "netboot-no-such-targetcli".to_owned(),
            configfs_root: PathBuf::from("/nonexistent/configfs"),
            ..ProvisionerConfig::default()
        };
        let missing = check_provisioner_prereqs(&config);
        assert_eq!(missing.len(), 2);

        let converter = ConverterConfig {
            command: "netboot-no-such-qemu-img".to_owned(),
            ..ConverterConfig::default()
        };
        let output = format_missing(&check_converter_prereqs(&converter));
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("netboot-no-such-qemu-img"));
    }
}
