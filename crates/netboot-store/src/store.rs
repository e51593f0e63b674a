use crate::layout::StateLayout;
use crate::snapshot::SnapshotFile;
use crate::tables::Tables;
use crate::StoreError;
use std::sync::Mutex;
use tracing::debug;

/// Shared owner of the record tables.
///
/// Every mutation runs as a transaction over a copy of the tables: the copy
/// is persisted (when a snapshot file is configured) and only then swapped
/// in, so a failed write never leaves memory ahead of disk. The mutex is a
/// `std` mutex and must never be held across an `.await`; closures passed to
/// [`read`](Self::read) and [`mutate`](Self::mutate) are synchronous.
pub struct Store {
    tables: Mutex<Tables>,
    snapshot: Option<SnapshotFile>,
}

impl Store {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Open (or create) the store persisted under `layout`.
    pub fn open(layout: &StateLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        let snapshot = SnapshotFile::new(layout.snapshot_file());
        let tables = snapshot.load()?.unwrap_or_default();
        debug!("opened state store at {}", layout.root().display());
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(snapshot),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let tables = self
            .tables
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("tables mutex poisoned: {e}")))?;
        Ok(f(&tables))
    }

    pub fn mutate<T, E>(&self, f: impl FnOnce(&mut Tables) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut tables = self
            .tables
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("tables mutex poisoned: {e}")))?;
        let mut next = tables.clone();
        let out = f(&mut next)?;
        if next != *tables {
            if let Some(ref snapshot) = self.snapshot {
                snapshot.write(&next)?;
            }
            *tables = next;
        }
        Ok(out)
    }

    /// A point-in-time copy of every table.
    pub fn snapshot(&self) -> Result<Tables, StoreError> {
        self.read(Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Machine, MachineState};
    use crate::types::MachineId;

    fn insert_machine(store: &Store, id: &str) {
        store
            .mutate(|t| {
                let id = MachineId::new(id);
                t.machines
                    .insert(id.clone(), Machine::new(id, "", MachineState::Registered));
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn failed_transaction_leaves_tables_untouched() {
        let store = Store::in_memory();
        insert_machine(&store, "M1");

        let result: Result<(), StoreError> = store.mutate(|t| {
            t.machines.clear();
            Err(StoreError::InvalidValue("abort".to_owned()))
        });
        assert!(result.is_err());
        assert_eq!(store.read(|t| t.machines.len()).unwrap(), 1);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        {
            let store = Store::open(&layout).unwrap();
            assert!(store.is_persistent());
            insert_machine(&store, "M1");
            insert_machine(&store, "M2");
        }
        let store = Store::open(&layout).unwrap();
        let ids: Vec<String> = store
            .read(|t| t.machines.keys().map(ToString::to_string).collect())
            .unwrap();
        assert_eq!(ids, vec!["M1", "M2"]);
    }

    #[test]
    fn read_only_transaction_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        let store = Store::open(&layout).unwrap();
        store.mutate(|_| Ok::<_, StoreError>(())).unwrap();
        assert!(!layout.snapshot_file().exists());
    }
}
