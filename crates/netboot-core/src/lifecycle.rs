use crate::CoreError;
use netboot_store::{BootStage, ImageState, JobState, MachineState, SessionState};
use std::fmt::Display;

fn check<S: Display>(valid: bool, from: S, to: S) -> Result<(), CoreError> {
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Session state machine.
///
/// STARTING only moves to STOPPING when a cancellation was requested while
/// provisioning; the caller checks that flag.
pub fn validate_session_transition(from: SessionState, to: SessionState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (
            SessionState::Starting,
            SessionState::Active | SessionState::Failed | SessionState::Stopping
        ) | (SessionState::Active, SessionState::Stopping)
            | (
                SessionState::Stopping,
                SessionState::Stopped | SessionState::Failed
            )
    );
    check(valid, from, to)
}

pub fn validate_image_transition(from: ImageState, to: ImageState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (ImageState::Uploading | ImageState::Error, ImageState::Processing)
            | (ImageState::Processing, ImageState::Ready | ImageState::Error)
    );
    check(valid, from, to)
}

pub fn validate_job_transition(from: JobState, to: JobState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (JobState::Pending, JobState::Processing | JobState::Failed)
            | (JobState::Processing, JobState::Completed | JobState::Failed)
    );
    check(valid, from, to)
}

/// States a machine passes through when it reports `stage`, in order.
///
/// Empty when the report does not change the state. An `online` report
/// from anything but BOOTING goes through BOOTING first.
pub fn machine_transitions(from: MachineState, stage: BootStage) -> Vec<MachineState> {
    match (from, stage) {
        (MachineState::Booting, BootStage::Booting)
        | (MachineState::Online, BootStage::Online)
        | (MachineState::Offline, BootStage::Offline) => Vec::new(),
        (_, BootStage::Booting) => vec![MachineState::Booting],
        (MachineState::Booting, BootStage::Online) => vec![MachineState::Online],
        (_, BootStage::Online) => vec![MachineState::Booting, MachineState::Online],
        (_, BootStage::Offline) => vec![MachineState::Offline],
    }
}
