use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// `[provisioner]` section of the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// `targetcli` or `mock`.
    pub backend: String,
    pub command: String,
    /// IQN prefix; target names are appended after a `:`.
    pub iqn_prefix: String,
    /// Portal the targets listen on, `ip:port`.
    pub portal: String,
    /// Mount point of the LIO configfs tree, used for listing.
    pub configfs_root: PathBuf,
    pub command_timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            backend: "targetcli".to_owned(),
            command: "targetcli".to_owned(),
            iqn_prefix: "iqn.2024-01.org.netboot".to_owned(),
            portal: "0.0.0.0:3260".to_owned(),
            configfs_root: PathBuf::from("/sys/kernel/config/target"),
            command_timeout_secs: 30,
        }
    }
}

impl ProvisionerConfig {
    pub fn mock() -> Self {
        Self {
            backend: "mock".to_owned(),
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// `[converter]` section of the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConverterConfig {
    /// `qemu-img` or `mock`.
    pub backend: String,
    pub command: String,
    /// Exit codes treated as retryable. 75 is `EX_TEMPFAIL`.
    pub transient_exit_codes: Vec<i32>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            backend: "qemu-img".to_owned(),
            command: "qemu-img".to_owned(),
            transient_exit_codes: vec![75],
        }
    }
}

impl ConverterConfig {
    pub fn mock() -> Self {
        Self {
            backend: "mock".to_owned(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_section_falls_back_to_defaults() {
        let cfg: ProvisionerConfig =
            serde_json::from_str(r#"{"iqn_prefix": "iqn.2030-01.lab"}"#).unwrap();
        assert_eq!(cfg.iqn_prefix, "iqn.2030-01.lab");
        assert_eq!(cfg.backend, "targetcli");
        assert_eq!(cfg.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn mock_constructors_select_mock_backend() {
        assert_eq!(ProvisionerConfig::mock().backend, "mock");
        assert_eq!(ConverterConfig::mock().backend, "mock");
        assert_eq!(ConverterConfig::default().transient_exit_codes, vec![75]);
    }
}
