use crate::records::{ConversionJob, Image, Machine, Session, Target};
use crate::types::{ImageId, JobId, MachineId, SessionId, TargetName};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The four logical tables (plus conversion jobs), keyed by surrogate id.
///
/// Records reference each other by id only; nothing here hands out a
/// mutable alias that outlives a [`Store`](crate::Store) transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tables {
    #[serde(default)]
    pub machines: BTreeMap<MachineId, Machine>,
    #[serde(default)]
    pub images: BTreeMap<ImageId, Image>,
    #[serde(default)]
    pub jobs: BTreeMap<JobId, ConversionJob>,
    #[serde(default)]
    pub targets: BTreeMap<TargetName, Target>,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, Session>,
}

impl Tables {
    pub fn machine(&self, id: &MachineId) -> Result<&Machine, StoreError> {
        self.machines
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("machine '{id}'")))
    }

    pub fn machine_mut(&mut self, id: &MachineId) -> Result<&mut Machine, StoreError> {
        self.machines
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("machine '{id}'")))
    }

    pub fn image(&self, id: &ImageId) -> Result<&Image, StoreError> {
        self.images
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("image '{id}'")))
    }

    pub fn image_mut(&mut self, id: &ImageId) -> Result<&mut Image, StoreError> {
        self.images
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("image '{id}'")))
    }

    pub fn job(&self, id: &JobId) -> Result<&ConversionJob, StoreError> {
        self.jobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("conversion job '{id}'")))
    }

    /// Write a job record. Terminal jobs are immutable.
    pub fn put_job(&mut self, job: ConversionJob) -> Result<(), StoreError> {
        if let Some(existing) = self.jobs.get(&job.id) {
            if existing.state.is_terminal() && *existing != job {
                return Err(StoreError::Immutable(format!(
                    "conversion job '{}' is {}",
                    job.id, existing.state
                )));
            }
        }
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn target(&self, name: &TargetName) -> Result<&Target, StoreError> {
        self.targets
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("target '{name}'")))
    }

    pub fn target_mut(&mut self, name: &TargetName) -> Result<&mut Target, StoreError> {
        self.targets
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("target '{name}'")))
    }

    pub fn session(&self, id: &SessionId) -> Result<&Session, StoreError> {
        self.sessions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("session '{id}'")))
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Result<&mut Session, StoreError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("session '{id}'")))
    }

    /// The session occupying `machine`, if any.
    pub fn live_session_for(&self, machine: &MachineId) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.machine_id == *machine && s.state.is_live())
    }

    /// The non-terminal conversion job of `image`, if any.
    pub fn pending_job_for(&self, image: &ImageId) -> Option<&ConversionJob> {
        self.jobs
            .values()
            .find(|j| j.image_id == *image && !j.state.is_terminal())
    }

    pub fn image_in_use(&self, image: &ImageId) -> bool {
        self.sessions
            .values()
            .any(|s| s.image_id == *image && s.state.is_live())
    }

    /// Destroy finished sessions beyond the `keep` most recently ended.
    /// Returns the ids removed.
    pub fn prune_sessions(&mut self, keep: usize) -> Vec<SessionId> {
        let finished = self
            .sessions
            .values()
            .filter(|s| s.state.is_terminal())
            .map(|s| (s.ended_at.unwrap_or(s.updated_at), s.id.clone()));
        let doomed = oldest_beyond(finished, keep);
        for id in &doomed {
            self.sessions.remove(id);
        }
        doomed
    }

    /// Destroy terminal conversion jobs beyond the `keep` most recently
    /// settled. Returns the ids removed.
    pub fn prune_jobs(&mut self, keep: usize) -> Vec<JobId> {
        let finished = self
            .jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .map(|j| (j.updated_at, j.id.clone()));
        let doomed = oldest_beyond(finished, keep);
        for id in &doomed {
            self.jobs.remove(id);
        }
        doomed
    }
}

fn oldest_beyond<K: Ord>(
    entries: impl Iterator<Item = (DateTime<Utc>, K)>,
    keep: usize,
) -> Vec<K> {
    let mut entries: Vec<_> = entries.collect();
    if entries.len() <= keep {
        return Vec::new();
    }
    entries.sort();
    let excess = entries.len() - keep;
    entries.into_iter().take(excess).map(|(_, id)| id).collect()
}
