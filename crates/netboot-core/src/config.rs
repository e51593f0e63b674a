use crate::CoreError;
use netboot_provision::{ConverterConfig, ProvisionerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netboot/netboot.toml";

/// Daemon configuration, read from a TOML file. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetbootConfig {
    pub state_dir: PathBuf,
    /// How long a STARTING session waits for the machine to confirm.
    pub confirmation_timeout_ms: u64,
    /// BOOTING/ONLINE machines silent for longer than this go OFFLINE.
    pub liveness_timeout_secs: u64,
    pub liveness_sweep_secs: u64,
    pub conversion_workers: usize,
    pub conversion_poll_ms: u64,
    /// Capacity of each per-entity event channel.
    pub event_buffer: usize,
    /// Events kept for the HTTP feed.
    pub event_history: usize,
    /// Finished sessions and conversion jobs kept in the state tables;
    /// older ones are destroyed as new ones finish.
    pub history_retention: usize,
    pub retry: RetryConfig,
    pub provisioner: ProvisionerConfig,
    pub converter: ConverterConfig,
    pub server: ServerConfig,
}

impl Default for NetbootConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/netboot"),
            confirmation_timeout_ms: 60_000,
            liveness_timeout_secs: 300,
            liveness_sweep_secs: 30,
            conversion_workers: 2,
            conversion_poll_ms: 500,
            event_buffer: 256,
            event_history: 1024,
            history_retention: 512,
            retry: RetryConfig::default(),
            provisioner: ProvisionerConfig::default(),
            converter: ConverterConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Retry schedule for transient provisioning and conversion failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 1000,
            multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7480".to_owned(),
        }
    }
}

impl NetbootConfig {
    /// Parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::parse(&content)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` when given; otherwise the system file if present, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, CoreError> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let fail = |msg: &str| Err(CoreError::Config(msg.to_owned()));
        if self.conversion_workers == 0 {
            return fail("conversion_workers must be at least 1");
        }
        if self.confirmation_timeout_ms == 0 {
            return fail("confirmation_timeout_ms must be non-zero");
        }
        if self.liveness_timeout_secs == 0 || self.liveness_sweep_secs == 0 {
            return fail("liveness timeouts must be non-zero");
        }
        if self.conversion_poll_ms == 0 {
            return fail("conversion_poll_ms must be non-zero");
        }
        if self.event_buffer == 0 {
            return fail("event_buffer must be non-zero");
        }
        if self.history_retention == 0 {
            return fail("history_retention must be at least 1");
        }
        if self.retry.multiplier == 0 {
            return fail("retry.multiplier must be at least 1");
        }
        if self.provisioner.command.trim().is_empty() || self.converter.command.trim().is_empty()
        {
            return fail("provisioner and converter commands must not be empty");
        }
        if self.server.listen.trim().is_empty() {
            return fail("server.listen must not be empty");
        }
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn liveness_sweep(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_secs)
    }

    pub fn conversion_poll(&self) -> Duration {
        Duration::from_millis(self.conversion_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = NetbootConfig::parse("").unwrap();
        assert_eq!(config, NetbootConfig::default());
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(60));
        assert_eq!(config.conversion_workers, 2);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.history_retention, 512);
    }

    #[test]
    fn sections_override_defaults() {
        let config = NetbootConfig::parse(
            r#"
state_dir = "/srv/netboot"
confirmation_timeout_ms = 90000

[retry]
initial_backoff_ms = 10

[provisioner]
backend = "mock"
iqn_prefix = "iqn.2030-01.lab"

[server]
listen = "0.0.0.0:8080"
"#,
        )
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/srv/netboot"));
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(90));
        assert_eq!(config.retry.initial_backoff_ms, 10);
        assert_eq!(config.retry.multiplier, 4);
        assert_eq!(config.provisioner.backend, "mock");
        assert_eq!(config.provisioner.command, "targetcli");
        assert_eq!(config.converter.backend, "qemu-img");
        assert_eq!(config.server.listen, "0.0.0.0:8080");
    }

    #[test]
    fn rejects_zero_workers() {
        let err = NetbootConfig::parse("conversion_workers = 0").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn rejects_empty_command() {
        let err = NetbootConfig::parse("[converter]\ncommand = \"\"").unwrap_err();
        assert!(err.to_string().contains("commands"));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(NetbootConfig::parse("state_dir = [").is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NetbootConfig::load(Path::new("/nonexistent/netboot.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netboot.toml");
        std::fs::write(&path, "event_buffer = 16\n").unwrap();
        let config = NetbootConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.event_buffer, 16);
    }
}
