use crate::convert::{ConversionRequest, ConversionStatus, ImageConverter};
use crate::target::TargetProvisioner;
use crate::ProvisionError;
use async_trait::async_trait;
use netboot_store::TargetName;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Provisioner operations a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Attach,
    Create,
    Delete,
    Detach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
}

impl Fault {
    fn to_error(self, op: MockOp, target: &TargetName) -> ProvisionError {
        let detail = format!("injected {op:?} fault for {target}");
        match self {
            Fault::Transient => ProvisionError::Transient(detail),
            Fault::Permanent => ProvisionError::Permanent(detail),
        }
    }
}

#[derive(Default)]
struct ProvisionerState {
    backing: BTreeMap<TargetName, PathBuf>,
    targets: BTreeSet<TargetName>,
    calls: HashMap<MockOp, u32>,
    queued: HashMap<MockOp, VecDeque<Fault>>,
    sticky: HashMap<MockOp, Fault>,
    delay: Duration,
}

impl ProvisionerState {
    fn enter(&mut self, op: MockOp, target: &TargetName) -> Result<(), ProvisionError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(fault) = self.queued.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(fault.to_error(op, target));
        }
        if let Some(fault) = self.sticky.get(&op) {
            return Err(fault.to_error(op, target));
        }
        Ok(())
    }
}

/// In-memory provisioner with call counters and fault injection.
#[derive(Default)]
pub struct MockProvisioner {
    state: Mutex<ProvisionerState>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProvisionerState>, ProvisionError> {
        self.state
            .lock()
            .map_err(|e| ProvisionError::Permanent(format!("mutex poisoned: {e}")))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProvisionerState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: MockOp, fault: Fault, times: u32) {
        self.with_state(|s| {
            let queue = s.queued.entry(op).or_default();
            queue.extend(std::iter::repeat(fault).take(times as usize));
        });
    }

    /// Fail every call of `op` until `clear_faults`.
    pub fn fail_always(&self, op: MockOp, fault: Fault) {
        self.with_state(|s| {
            s.sticky.insert(op, fault);
        });
    }

    pub fn clear_faults(&self) {
        self.with_state(|s| {
            s.queued.clear();
            s.sticky.clear();
        });
    }

    /// Delay applied before attach and create, for observing in-flight work.
    pub fn set_delay(&self, delay: Duration) {
        self.with_state(|s| s.delay = delay);
    }

    pub fn calls(&self, op: MockOp) -> u32 {
        self.with_state(|s| s.calls.get(&op).copied().unwrap_or(0))
    }

    pub fn has_target(&self, target: &TargetName) -> bool {
        self.with_state(|s| s.targets.contains(target))
    }

    pub fn has_backing_store(&self, target: &TargetName) -> bool {
        self.with_state(|s| s.backing.contains_key(target))
    }

    pub fn backing_path(&self, target: &TargetName) -> Option<PathBuf> {
        self.with_state(|s| s.backing.get(target).cloned())
    }

    /// Plant a fully provisioned target without going through the trait,
    /// as if it had been left behind by an earlier run.
    pub fn insert_existing(&self, target: &TargetName, backing_path: &Path) {
        self.with_state(|s| {
            s.backing.insert(target.clone(), backing_path.to_path_buf());
            s.targets.insert(target.clone());
        });
    }

    async fn pause(&self) {
        let delay = self.with_state(|s| s.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TargetProvisioner for MockProvisioner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn attach_backing_store(
        &self,
        target: &TargetName,
        backing_path: &Path,
    ) -> Result<(), ProvisionError> {
        self.pause().await;
        let mut state = self.lock()?;
        state.enter(MockOp::Attach, target)?;
        if state.backing.contains_key(target) {
            return Err(ProvisionError::AlreadyExists(format!(
                "backing store {target}"
            )));
        }
        state
            .backing
            .insert(target.clone(), backing_path.to_path_buf());
        Ok(())
    }

    async fn create_target(&self, target: &TargetName) -> Result<(), ProvisionError> {
        self.pause().await;
        let mut state = self.lock()?;
        state.enter(MockOp::Create, target)?;
        if !state.backing.contains_key(target) {
            return Err(ProvisionError::Permanent(format!(
                "no backing store attached for {target}"
            )));
        }
        if !state.targets.insert(target.clone()) {
            return Err(ProvisionError::AlreadyExists(format!("target {target}")));
        }
        Ok(())
    }

    async fn delete_target(&self, target: &TargetName) -> Result<(), ProvisionError> {
        let mut state = self.lock()?;
        state.enter(MockOp::Delete, target)?;
        if state.targets.remove(target) {
            Ok(())
        } else {
            Err(ProvisionError::NotFound(format!("target {target}")))
        }
    }

    async fn detach_backing_store(&self, target: &TargetName) -> Result<(), ProvisionError> {
        let mut state = self.lock()?;
        state.enter(MockOp::Detach, target)?;
        if state.backing.remove(target).is_some() {
            Ok(())
        } else {
            Err(ProvisionError::NotFound(format!("backing store {target}")))
        }
    }

    async fn list_targets(&self) -> Result<Vec<TargetName>, ProvisionError> {
        Ok(self.lock()?.targets.iter().cloned().collect())
    }

    async fn list_backing_stores(&self) -> Result<Vec<TargetName>, ProvisionError> {
        Ok(self.lock()?.backing.keys().cloned().collect())
    }
}

/// Scripted result of one mock conversion invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Succeed,
    FailTransient(String),
    FailPermanent(String),
    /// Never leaves `Running`.
    Hang,
}

struct Invocation {
    request: ConversionRequest,
    outcome: MockOutcome,
    polls: u32,
    settled: Option<ConversionStatus>,
}

struct ConverterState {
    script: VecDeque<MockOutcome>,
    invocations: Vec<Invocation>,
    steps: u32,
}

/// Converter that settles each invocation after a fixed number of polls.
///
/// Outcomes are taken from the script in submit order; an empty script
/// means success. A successful run copies the source to the output path,
/// or writes an empty output file when the source is missing.
pub struct MockConverter {
    state: Mutex<ConverterState>,
}

impl Default for MockConverter {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConverterState {
                script: VecDeque::new(),
                invocations: Vec::new(),
                steps: 2,
            }),
        }
    }
}

impl MockConverter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ConverterState>, ProvisionError> {
        self.state
            .lock()
            .map_err(|e| ProvisionError::Permanent(format!("mutex poisoned: {e}")))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ConverterState) -> T) -> T {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.with_state(|s| s.script.extend(outcomes));
    }

    /// Polls an invocation takes to settle. At least one.
    pub fn set_steps(&self, steps: u32) {
        self.with_state(|s| s.steps = steps.max(1));
    }

    pub fn invocations(&self) -> usize {
        self.with_state(|s| s.invocations.len())
    }

    pub fn requests(&self) -> Vec<ConversionRequest> {
        self.with_state(|s| s.invocations.iter().map(|i| i.request.clone()).collect())
    }

    fn write_output(request: &ConversionRequest) -> Result<(), ProvisionError> {
        if let Some(parent) = request.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if request.source_path.is_file() {
            std::fs::copy(&request.source_path, &request.output_path)?;
        } else {
            std::fs::write(&request.output_path, b"")?;
        }
        Ok(())
    }
}

#[async_trait]
impl ImageConverter for MockConverter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, request: &ConversionRequest) -> Result<String, ProvisionError> {
        let mut state = self.lock()?;
        let outcome = state.script.pop_front().unwrap_or(MockOutcome::Succeed);
        state.invocations.push(Invocation {
            request: request.clone(),
            outcome,
            polls: 0,
            settled: None,
        });
        Ok(format!("mock-{}", state.invocations.len() - 1))
    }

    async fn poll(&self, handle: &str) -> Result<ConversionStatus, ProvisionError> {
        let mut state = self.lock()?;
        let steps = state.steps;
        let inv = handle
            .strip_prefix("mock-")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| state.invocations.get_mut(n))
            .ok_or_else(|| ProvisionError::NotFound(format!("conversion {handle}")))?;

        if let Some(ref settled) = inv.settled {
            return Ok(settled.clone());
        }
        inv.polls += 1;
        let progress = (inv.polls * 100 / steps).min(99) as u8;
        if inv.polls < steps || inv.outcome == MockOutcome::Hang {
            return Ok(ConversionStatus::running(progress));
        }

        let status = match inv.outcome {
            MockOutcome::Succeed => match Self::write_output(&inv.request) {
                Ok(()) => ConversionStatus::succeeded(),
                Err(e) => ConversionStatus::failed(progress, e.to_string(), false),
            },
            MockOutcome::FailTransient(ref msg) => {
                ConversionStatus::failed(progress / 2, msg.clone(), true)
            }
            MockOutcome::FailPermanent(ref msg) => {
                ConversionStatus::failed(progress / 2, msg.clone(), false)
            }
            MockOutcome::Hang => ConversionStatus::running(progress),
        };
        inv.settled = Some(status.clone());
        Ok(status)
    }
}
