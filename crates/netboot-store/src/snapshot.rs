use crate::layout::STATE_FORMAT_VERSION;
use crate::tables::Tables;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    tables: Tables,
    /// blake3 checksum of the snapshot serialized without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl Snapshot {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Atomically replaced JSON image of the [`Tables`].
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, tables: &Tables) -> Result<(), StoreError> {
        let mut snapshot = Snapshot {
            format_version: STATE_FORMAT_VERSION,
            tables: tables.clone(),
            checksum: None,
        };
        snapshot.checksum = Some(snapshot.compute_checksum()?);
        let content = serde_json::to_string_pretty(&snapshot)?;

        let dir = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    /// Load the snapshot. `Ok(None)` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<Tables>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        if snapshot.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: snapshot.format_version,
            });
        }
        if let Some(ref expected) = snapshot.checksum {
            let actual = snapshot.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    what: self.path.display().to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        debug!(
            "loaded snapshot {}: {} machines, {} images, {} sessions",
            self.path.display(),
            snapshot.tables.machines.len(),
            snapshot.tables.images.len(),
            snapshot.tables.sessions.len()
        );
        Ok(Some(snapshot.tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Machine, MachineState};
    use crate::types::MachineId;

    fn sample_tables() -> Tables {
        let mut tables = Tables::default();
        let id = MachineId::new("aa:bb:cc:dd:ee:ff");
        tables
            .machines
            .insert(id.clone(), Machine::new(id, "lab-07", MachineState::Registered));
        tables
    }

    #[test]
    fn missing_snapshot_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn written_snapshot_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));
        let tables = sample_tables();
        file.write(&tables).unwrap();
        assert_eq!(file.load().unwrap(), Some(tables));
    }

    #[test]
    fn tampered_snapshot_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));
        file.write(&sample_tables()).unwrap();

        let content = fs::read_to_string(file.path()).unwrap();
        fs::write(file.path(), content.replace("lab-07", "lab-08")).unwrap();

        assert!(matches!(
            file.load(),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }
}
