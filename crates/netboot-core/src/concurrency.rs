use crate::CoreError;
use fs2::FileExt;
use netboot_store::MachineId;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Exclusive lock on a state directory, so two daemons never share one.
pub struct StateLock {
    lock_file: File,
}

impl StateLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// `None` when another process holds the lock.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

type LeaseSet = Arc<Mutex<HashSet<MachineId>>>;

/// Per-machine exclusivity for session workflows.
#[derive(Clone, Default)]
pub struct MachineLeases {
    held: LeaseSet,
}

/// Held lease on one machine; released on drop.
#[derive(Debug)]
pub struct MachineLease {
    machine: MachineId,
    held: LeaseSet,
}

impl MachineLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another workflow holds the machine.
    pub fn try_acquire(&self, machine: &MachineId) -> Option<MachineLease> {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !held.insert(machine.clone()) {
            return None;
        }
        debug!("lease acquired on machine {machine}");
        Some(MachineLease {
            machine: machine.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, machine: &MachineId) -> bool {
        match self.held.lock() {
            Ok(held) => held.contains(machine),
            Err(poisoned) => poisoned.into_inner().contains(machine),
        }
    }
}

impl MachineLease {
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }
}

impl Drop for MachineLease {
    fn drop(&mut self) {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.machine);
        debug!("lease released on machine {}", self.machine);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping after in-flight requests...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
