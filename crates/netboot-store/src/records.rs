use crate::types::{ImageId, JobId, MachineId, SessionId, TargetName};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Unknown,
    Registered,
    Booting,
    Online,
    Offline,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Unknown => write!(f, "unknown"),
            MachineState::Registered => write!(f, "registered"),
            MachineState::Booting => write!(f, "booting"),
            MachineState::Online => write!(f, "online"),
            MachineState::Offline => write!(f, "offline"),
        }
    }
}

/// Stage reported by the network-boot firmware or the in-guest agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootStage {
    /// Firmware fetched its boot program and is attaching the target.
    Booting,
    /// The guest OS came up on the exported disk.
    Online,
    /// Orderly shutdown, or a liveness timeout.
    Offline,
}

impl BootStage {
    /// Whether a report of this stage proves the machine reached its target.
    pub fn confirms_attach(self) -> bool {
        matches!(self, BootStage::Booting | BootStage::Online)
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootStage::Booting => write!(f, "booting"),
            BootStage::Online => write!(f, "online"),
            BootStage::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for BootStage {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booting" | "Booting" => Ok(BootStage::Booting),
            "online" | "Online" => Ok(BootStage::Online),
            "offline" | "Offline" => Ok(BootStage::Offline),
            other => Err(StoreError::InvalidValue(format!("unknown boot stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    pub id: MachineId,
    pub display_name: String,
    pub state: MachineState,
    /// Back-reference to the live session using this machine. The session
    /// table is authoritative.
    #[serde(default)]
    pub active_session: Option<SessionId>,
    #[serde(default)]
    pub last_stage: Option<BootStage>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    pub fn new(id: MachineId, display_name: impl Into<String>, state: MachineState) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            state,
            active_session: None,
            last_stage: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    Vhdx,
    Vmdk,
    Vdi,
}

impl ImageFormat {
    /// Exported targets are file-backed block devices, so anything that is
    /// not already raw goes through a conversion job first.
    pub fn requires_conversion(self) -> bool {
        self != ImageFormat::Raw
    }

    /// Format name as understood by `qemu-img`.
    pub fn qemu_name(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vpc",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Qcow2 => write!(f, "qcow2"),
            ImageFormat::Vhd => write!(f, "vhd"),
            ImageFormat::Vhdx => write!(f, "vhdx"),
            ImageFormat::Vmdk => write!(f, "vmdk"),
            ImageFormat::Vdi => write!(f, "vdi"),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "img" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vhd" | "vpc" => Ok(ImageFormat::Vhd),
            "vhdx" => Ok(ImageFormat::Vhdx),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "vdi" => Ok(ImageFormat::Vdi),
            other => Err(StoreError::InvalidValue(format!(
                "unsupported image format '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Uploading,
    Processing,
    Ready,
    Error,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageState::Uploading => write!(f, "uploading"),
            ImageState::Processing => write!(f, "processing"),
            ImageState::Ready => write!(f, "ready"),
            ImageState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub id: ImageId,
    pub format: ImageFormat,
    /// Where the uploaded bytes live.
    pub source_path: PathBuf,
    /// blake3 hex digest of the uploaded source file.
    #[serde(default)]
    pub checksum: Option<String>,
    /// File handed to targets as backing store. Set once READY.
    #[serde(default)]
    pub export_path: Option<PathBuf>,
    pub state: ImageState,
    #[serde(default)]
    pub active_job: Option<JobId>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionJob {
    pub id: JobId,
    pub image_id: ImageId,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub state: JobState,
    /// Percent complete, 0-100. Never decreases within a job.
    pub progress: u8,
    /// Conversion invocations made so far.
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Inactive,
    Active,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Inactive => write!(f, "inactive"),
            TargetState::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub name: TargetName,
    pub machine_id: MachineId,
    pub image_id: ImageId,
    pub backing_path: PathBuf,
    pub state: TargetState,
    /// Set when teardown failed and the target was left ACTIVE for an operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// States that occupy the machine.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub machine_id: MachineId,
    pub image_id: ImageId,
    #[serde(default)]
    pub target: Option<TargetName>,
    pub state: SessionState,
    /// A stop arrived while STARTING; honoured after the current step.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn starting(machine_id: MachineId, image_id: ImageId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            machine_id,
            image_id,
            target: None,
            state: SessionState::Starting,
            cancel_requested: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_classification() {
        assert!(SessionState::Starting.is_live());
        assert!(SessionState::Active.is_live());
        assert!(SessionState::Stopping.is_live());
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    #[test]
    fn job_state_terminality() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn image_format_parsing() {
        assert_eq!("qcow2".parse::<ImageFormat>().unwrap(), ImageFormat::Qcow2);
        assert_eq!("VHDX".parse::<ImageFormat>().unwrap(), ImageFormat::Vhdx);
        assert_eq!("img".parse::<ImageFormat>().unwrap(), ImageFormat::Raw);
        assert!("iso".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn only_raw_skips_conversion() {
        assert!(!ImageFormat::Raw.requires_conversion());
        assert!(ImageFormat::Qcow2.requires_conversion());
        assert_eq!(ImageFormat::Vhd.qemu_name(), "vpc");
    }

    #[test]
    fn boot_stage_parsing_and_confirmation() {
        assert_eq!("online".parse::<BootStage>().unwrap(), BootStage::Online);
        assert!("rebooting".parse::<BootStage>().is_err());
        assert!(BootStage::Booting.confirms_attach());
        assert!(BootStage::Online.confirms_attach());
        assert!(!BootStage::Offline.confirms_attach());
    }

    #[test]
    fn states_serialize_lowercase() {
        let json = serde_json::to_string(&SessionState::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
        let json = serde_json::to_string(&MachineState::Online).unwrap();
        assert_eq!(json, "\"online\"");
    }

    #[test]
    fn new_session_starts_in_starting() {
        let s = Session::starting("M1".into(), "win11-base".into());
        assert_eq!(s.state, SessionState::Starting);
        assert!(s.target.is_none());
        assert!(!s.cancel_requested);
    }
}
