use crate::catalog::ImageCatalog;
use crate::concurrency::{MachineLease, MachineLeases, StateLock};
use crate::config::NetbootConfig;
use crate::events::{EntityKind, EventPublisher};
use crate::jobs::JobTracker;
use crate::lifecycle::validate_session_transition;
use crate::registry::MachineRegistry;
use crate::retry::RetryPolicy;
use crate::targets::{ReconcileReport, TargetManager};
use crate::CoreError;
use chrono::{DateTime, Utc};
use netboot_provision::{select_converter, select_provisioner, ImageConverter, TargetProvisioner};
use netboot_store::{
    validate_image_name, validate_machine_id, BootStage, ImageId, ImageState, JobId, Machine,
    MachineId, Session, SessionId, SessionState, StateLayout, Store, Target, TargetName,
    TargetState,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What [`Orchestrator::recover`] cleaned up after an unclean shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub failed_sessions: Vec<SessionId>,
    pub resumed_sessions: Vec<SessionId>,
    pub failed_jobs: Vec<JobId>,
    pub failed_images: Vec<ImageId>,
    pub deactivated_targets: Vec<TargetName>,
    pub reconciled: ReconcileReport,
}

/// Session workflows in flight: cancellation tokens of STARTING sessions
/// and the leases of ACTIVE ones.
#[derive(Default)]
struct Running {
    tokens: HashMap<SessionId, CancellationToken>,
    leases: HashMap<SessionId, MachineLease>,
}

struct Inner {
    store: Arc<Store>,
    events: Arc<EventPublisher>,
    registry: MachineRegistry,
    catalog: ImageCatalog,
    targets: TargetManager,
    leases: MachineLeases,
    retry: RetryPolicy,
    confirmation_timeout: Duration,
    liveness_sweep: Duration,
    history_retention: usize,
    running: Mutex<Running>,
    _state_lock: Option<StateLock>,
}

enum Provisioned {
    Confirmed,
    Cancelled,
}

/// Drives boot sessions from STARTING to a terminal state.
///
/// `start` and `stop` validate, persist the first transition and return;
/// the provisioning and teardown steps run as background tasks that own
/// the machine's lease. Every failure path tears down what was created
/// before the session is marked FAILED.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: &NetbootConfig,
        store: Arc<Store>,
        provisioner: Arc<dyn TargetProvisioner>,
        converter: Arc<dyn ImageConverter>,
    ) -> Self {
        Self::build(config, store, provisioner, converter, None)
    }

    /// Lock the configured state directory, load its snapshot and select
    /// the configured backends.
    pub fn open(config: &NetbootConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = StateLayout::new(&config.state_dir);
        let lock = StateLock::try_acquire(&layout.lock_file())?.ok_or_else(|| {
            CoreError::ConcurrencyConflict(format!(
                "state directory {} is locked by another process",
                layout.root().display()
            ))
        })?;
        let store = Arc::new(Store::open(&layout)?);
        let provisioner = select_provisioner(&config.provisioner)
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let converter =
            select_converter(&config.converter).map_err(|e| CoreError::Config(e.to_string()))?;
        info!(
            "state at {} (provisioner {}, converter {})",
            layout.root().display(),
            provisioner.name(),
            converter.name()
        );
        Ok(Self::build(config, store, provisioner, converter, Some(lock)))
    }

    fn build(
        config: &NetbootConfig,
        store: Arc<Store>,
        provisioner: Arc<dyn TargetProvisioner>,
        converter: Arc<dyn ImageConverter>,
        state_lock: Option<StateLock>,
    ) -> Self {
        let events = Arc::new(EventPublisher::new(
            config.event_buffer,
            config.event_history,
        ));
        let retry = RetryPolicy::from(&config.retry);
        let tracker = JobTracker::new(
            Arc::clone(&store),
            Arc::clone(&events),
            converter,
            config.conversion_workers,
            retry,
            config.conversion_poll(),
            config.history_retention,
        );
        Self {
            inner: Arc::new(Inner {
                registry: MachineRegistry::new(
                    Arc::clone(&store),
                    Arc::clone(&events),
                    config.liveness_timeout(),
                ),
                catalog: ImageCatalog::new(
                    Arc::clone(&store),
                    Arc::clone(&events),
                    tracker,
                    StateLayout::new(&config.state_dir),
                ),
                targets: TargetManager::new(Arc::clone(&store), Arc::clone(&events), provisioner),
                store,
                events,
                leases: MachineLeases::new(),
                retry,
                confirmation_timeout: config.confirmation_timeout(),
                liveness_sweep: config.liveness_sweep(),
                history_retention: config.history_retention,
                running: Mutex::new(Running::default()),
                _state_lock: state_lock,
            }),
        }
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.inner.registry
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.inner.catalog
    }

    pub fn jobs(&self) -> &JobTracker {
        self.inner.catalog.tracker()
    }

    pub fn targets(&self) -> &TargetManager {
        &self.inner.targets
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub fn leases(&self) -> &MachineLeases {
        &self.inner.leases
    }

    fn running(&self) -> MutexGuard<'_, Running> {
        match self.inner.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin a boot session of `image` on `machine`.
    ///
    /// Returns the persisted STARTING session; provisioning and the wait
    /// for the machine's confirmation continue in the background.
    pub fn start(&self, machine: &MachineId, image: &ImageId) -> Result<Session, CoreError> {
        validate_machine_id(machine)?;
        validate_image_name(image)?;

        let backing = self.inner.store.read(|t| {
            if !t.machines.contains_key(machine) {
                return Err(CoreError::Validation(format!("unknown machine {machine}")));
            }
            let Some(img) = t.images.get(image) else {
                return Err(CoreError::Validation(format!("unknown image {image}")));
            };
            if img.state != ImageState::Ready {
                return Err(CoreError::Validation(format!(
                    "image {image} is {}, not ready",
                    img.state
                )));
            }
            img.export_path
                .clone()
                .ok_or_else(|| CoreError::Validation(format!("image {image} has no export path")))
        })??;

        let lease = self.inner.leases.try_acquire(machine).ok_or_else(|| {
            CoreError::ConcurrencyConflict(format!("machine {machine} has a session in progress"))
        })?;

        let session = self.inner.store.mutate(|t| {
            if let Some(live) = t.live_session_for(machine) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "machine {machine} is in use by session {} ({})",
                    live.id, live.state
                )));
            }
            if t.image(image)?.state != ImageState::Ready {
                return Err(CoreError::Validation(format!("image {image} is not ready")));
            }
            let session = Session::starting(machine.clone(), image.clone());
            t.machine_mut(machine)?.active_session = Some(session.id.clone());
            t.sessions.insert(session.id.clone(), session.clone());
            Ok(session)
        })?;

        info!(
            "session {} starting: {image} on machine {machine}",
            session.id
        );
        self.inner.events.publish(
            EntityKind::Session,
            &session.id,
            session.state,
            Some(format!("machine {machine} image {image}")),
        );

        let cancel = CancellationToken::new();
        self.running()
            .tokens
            .insert(session.id.clone(), cancel.clone());
        // Subscribed before returning, so no confirmation can slip past.
        let confirmations = self.inner.registry.confirmations(machine);

        let this = self.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            this.run_start(id, backing, lease, cancel, confirmations)
                .await;
        });
        Ok(session)
    }

    async fn run_start(
        self,
        id: SessionId,
        backing: PathBuf,
        lease: MachineLease,
        cancel: CancellationToken,
        confirmations: watch::Receiver<u64>,
    ) {
        let outcome = self
            .provision(&id, &backing, &cancel, confirmations)
            .await;
        self.running().tokens.remove(&id);
        match outcome {
            Ok(Provisioned::Confirmed) => self.activate(&id, lease).await,
            Ok(Provisioned::Cancelled) => self.cancel_start(&id, lease).await,
            Err(e) => self.fail_start(&id, &e, lease).await,
        }
    }

    async fn provision(
        &self,
        id: &SessionId,
        backing: &Path,
        cancel: &CancellationToken,
        mut confirmations: watch::Receiver<u64>,
    ) -> Result<Provisioned, CoreError> {
        let session = self.get(id)?;
        if cancel.is_cancelled() || session.cancel_requested {
            return Ok(Provisioned::Cancelled);
        }

        let targets = &self.inner.targets;
        let machine = &session.machine_id;
        let image = &session.image_id;
        let target = self
            .inner
            .retry
            .run("target provisioning", move || {
                targets.ensure_active(machine, image, backing)
            })
            .await?;

        let cancel_requested = self.inner.store.mutate(|t| {
            let s = t.session_mut(id)?;
            s.target = Some(target.name.clone());
            s.updated_at = Utc::now();
            Ok::<_, CoreError>(s.cancel_requested)
        })?;
        self.inner.events.publish(
            EntityKind::Session,
            id,
            SessionState::Starting,
            Some(format!("provisioned target {}", target.name)),
        );
        if cancel_requested || cancel.is_cancelled() {
            return Ok(Provisioned::Cancelled);
        }

        debug!("session {id} waiting for machine {machine} to confirm");
        let timeout = self.inner.confirmation_timeout;
        tokio::select! {
            changed = confirmations.changed() => {
                if changed.is_err() {
                    return Err(CoreError::Validation(format!(
                        "machine {machine} was deregistered"
                    )));
                }
                Ok(Provisioned::Confirmed)
            }
            () = cancel.cancelled() => Ok(Provisioned::Cancelled),
            () = tokio::time::sleep(timeout) => Err(CoreError::Timeout(format!(
                "machine {machine} did not confirm within {timeout:?}"
            ))),
        }
    }

    async fn activate(&self, id: &SessionId, lease: MachineLease) {
        // Parked before the state flips, so a stop on the ACTIVE session
        // always finds the lease.
        self.running().leases.insert(id.clone(), lease);
        let activated = self.inner.store.mutate(|t| {
            let s = t.session_mut(id)?;
            if s.cancel_requested {
                return Ok(None);
            }
            validate_session_transition(s.state, SessionState::Active)?;
            s.state = SessionState::Active;
            s.updated_at = Utc::now();
            Ok::<_, CoreError>(Some(s.clone()))
        });
        match activated {
            Ok(Some(session)) => {
                info!("session {id} active on machine {}", session.machine_id);
                self.inner
                    .events
                    .publish(EntityKind::Session, id, session.state, None);
            }
            Ok(None) => {
                let lease = self.running().leases.remove(id);
                if let Some(lease) = lease {
                    self.cancel_start(id, lease).await;
                }
            }
            Err(e) => {
                let lease = self.running().leases.remove(id);
                if let Some(lease) = lease {
                    self.fail_start(id, &e, lease).await;
                }
            }
        }
    }

    /// STARTING -> STOPPING after a deferred stop, then normal teardown.
    async fn cancel_start(&self, id: &SessionId, lease: MachineLease) {
        let stopping = self.inner.store.mutate(|t| {
            let s = t.session_mut(id)?;
            validate_session_transition(s.state, SessionState::Stopping)?;
            s.state = SessionState::Stopping;
            s.updated_at = Utc::now();
            Ok::<_, CoreError>(())
        });
        if let Err(e) = stopping {
            error!("session {id}: cannot move to stopping: {e}");
            return;
        }
        info!("session {id} cancelled while starting");
        self.inner.events.publish(
            EntityKind::Session,
            id,
            SessionState::Stopping,
            Some("cancelled while starting".to_owned()),
        );
        self.teardown(id, Some(lease)).await;
    }

    async fn fail_start(&self, id: &SessionId, cause: &CoreError, lease: MachineLease) {
        warn!("session {id} failed to start: {cause}");
        let mut reason = cause.to_string();
        match self.get(id).map(|s| s.target) {
            Ok(Some(target)) => match self.deactivate_with_retry(&target).await {
                Ok(()) => reason.push_str("; target torn down"),
                Err(e) => {
                    reason.push_str(&format!("; teardown of target {target} failed: {e}"));
                    self.flag(&target, &e);
                }
            },
            Ok(None) => {}
            Err(e) => warn!("session {id}: cannot load for rollback: {e}"),
        }
        self.finish(id, SessionState::Failed, Some(reason), Some(lease));
    }

    async fn deactivate_with_retry(&self, target: &TargetName) -> Result<(), CoreError> {
        let targets = &self.inner.targets;
        self.inner
            .retry
            .run("target teardown", move || targets.ensure_inactive(target))
            .await
    }

    fn flag(&self, target: &TargetName, cause: &CoreError) {
        if let Err(e) = self
            .inner
            .targets
            .mark_attention(target, &format!("teardown failed: {cause}"))
        {
            error!("could not flag target {target} for attention: {e}");
        }
    }

    /// Tear down the session's target and settle it STOPPED, or FAILED with
    /// the target left ACTIVE and flagged when teardown keeps failing.
    async fn teardown(&self, id: &SessionId, lease: Option<MachineLease>) {
        let target = match self.get(id) {
            Ok(session) => session.target,
            Err(e) => {
                error!("session {id}: cannot load for teardown: {e}");
                return;
            }
        };
        let result = match target {
            Some(ref name) => self.deactivate_with_retry(name).await,
            None => Ok(()),
        };
        match (result, target) {
            (Ok(()), _) => self.finish(id, SessionState::Stopped, None, lease),
            (Err(e), Some(name)) => {
                self.flag(&name, &e);
                self.finish(
                    id,
                    SessionState::Failed,
                    Some(format!("teardown of target {name} failed: {e}")),
                    lease,
                );
            }
            (Err(e), None) => {
                self.finish(id, SessionState::Failed, Some(e.to_string()), lease);
            }
        }
    }

    /// Persist a terminal state. The lease is released after the write and
    /// before the event goes out.
    fn finish(
        &self,
        id: &SessionId,
        state: SessionState,
        reason: Option<String>,
        lease: Option<MachineLease>,
    ) {
        let result = self.inner.store.mutate(|t| {
            let s = t.session_mut(id)?;
            validate_session_transition(s.state, state)?;
            let now = Utc::now();
            s.state = state;
            s.failure_reason.clone_from(&reason);
            s.ended_at = Some(now);
            s.updated_at = now;
            let machine = s.machine_id.clone();
            if let Ok(m) = t.machine_mut(&machine) {
                if m.active_session.as_ref() == Some(id) {
                    m.active_session = None;
                }
            }
            Ok::<_, CoreError>(t.prune_sessions(self.inner.history_retention))
        });
        drop(lease);
        match result {
            Ok(pruned) => {
                match state {
                    SessionState::Failed => warn!(
                        "session {id} failed: {}",
                        reason.as_deref().unwrap_or("unknown reason")
                    ),
                    _ => info!("session {id} {state}"),
                }
                self.inner
                    .events
                    .publish(EntityKind::Session, id, state, reason);
                for old in pruned {
                    debug!("session {old} dropped from history");
                    self.inner.events.forget(EntityKind::Session, &old);
                }
            }
            Err(e) => error!("session {id}: cannot record {state}: {e}"),
        }
    }

    /// Stop a session.
    ///
    /// ACTIVE sessions move to STOPPING and are torn down in the background.
    /// A STARTING session records a deferred cancellation, honoured after
    /// its current step. Anything else is rejected.
    pub fn stop(&self, id: &SessionId) -> Result<Session, CoreError> {
        let session = self.inner.store.mutate(|t| {
            let s = t.session_mut(id)?;
            match s.state {
                SessionState::Active => {
                    validate_session_transition(s.state, SessionState::Stopping)?;
                    s.state = SessionState::Stopping;
                }
                SessionState::Starting => s.cancel_requested = true,
                other => {
                    return Err(CoreError::Validation(format!(
                        "session {id} is {other}; only active or starting sessions can be stopped"
                    )))
                }
            }
            s.updated_at = Utc::now();
            Ok(s.clone())
        })?;

        if session.state == SessionState::Starting {
            info!("session {id}: stop deferred until provisioning step completes");
            self.inner.events.publish(
                EntityKind::Session,
                id,
                session.state,
                Some("cancellation requested".to_owned()),
            );
            if let Some(token) = self.running().tokens.get(id) {
                token.cancel();
            }
            return Ok(session);
        }

        info!("session {id} stopping");
        self.inner
            .events
            .publish(EntityKind::Session, id, session.state, None);
        let lease = self.running().leases.remove(id);
        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move { this.teardown(&id, lease).await });
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<Session, CoreError> {
        Ok(self.inner.store.read(|t| t.session(id).cloned())??)
    }

    pub fn list(&self) -> Result<Vec<Session>, CoreError> {
        let mut sessions: Vec<Session> = self
            .inner
            .store
            .read(|t| t.sessions.values().cloned().collect())?;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Boot-stage callback. `booting` and `online` also confirm a STARTING
    /// session on the machine; for sessions past STARTING they change
    /// nothing but the machine record.
    pub fn report_boot_event(
        &self,
        machine: &MachineId,
        stage: BootStage,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Machine, CoreError> {
        self.inner.registry.report_boot_event(machine, stage, timestamp)
    }

    /// Health-probe confirmation for `machine`.
    pub fn confirm(&self, machine: &MachineId) -> Result<Machine, CoreError> {
        self.inner.registry.confirm(machine)
    }

    pub async fn repair_target(&self, name: &TargetName) -> Result<Target, CoreError> {
        self.inner.targets.repair(name).await
    }

    /// Wait until the session is in one of `states`.
    pub async fn wait_for_state(
        &self,
        id: &SessionId,
        states: &[SessionState],
        timeout: Duration,
    ) -> Result<Session, CoreError> {
        let mut rx = self.inner.events.subscribe(EntityKind::Session);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let session = self.get(id)?;
            if states.contains(&session.state) {
                return Ok(session);
            }
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Ok(event)) if event.entity_id != id.as_str() => continue,
                    Ok(Ok(_) | Err(RecvError::Lagged(_))) => break,
                    Ok(Err(RecvError::Closed)) => {
                        return Err(CoreError::Timeout("event channel closed".to_owned()))
                    }
                    Err(_) => {
                        return Err(CoreError::Timeout(format!(
                            "session {id} still {} after {timeout:?}",
                            session.state
                        )))
                    }
                }
            }
        }
    }

    /// Startup recovery after an unclean shutdown.
    ///
    /// Sessions caught STARTING or STOPPING are torn down and FAILED,
    /// ACTIVE sessions get their leases back, targets no live session owns
    /// are deactivated, unfinished conversions are failed, and finally
    /// external objects without a record are removed.
    pub async fn recover(&self) -> Result<RecoveryReport, CoreError> {
        let mut report = RecoveryReport {
            failed_jobs: self.jobs().recover()?,
            failed_images: self.inner.catalog.recover()?,
            ..RecoveryReport::default()
        };

        let sessions = self.list()?;
        for session in sessions.iter().filter(|s| s.state.is_live()) {
            if session.state == SessionState::Active {
                match self.inner.leases.try_acquire(&session.machine_id) {
                    Some(lease) => {
                        self.running().leases.insert(session.id.clone(), lease);
                        report.resumed_sessions.push(session.id.clone());
                    }
                    None => warn!("session {}: machine lease already held", session.id),
                }
                continue;
            }

            let mut reason = "interrupted by daemon restart".to_owned();
            if let Some(ref target) = session.target {
                match self.deactivate_with_retry(target).await {
                    Ok(()) => reason.push_str("; target torn down"),
                    Err(e) => {
                        reason.push_str(&format!("; teardown of target {target} failed: {e}"));
                        self.flag(target, &e);
                    }
                }
            }
            self.finish(&session.id, SessionState::Failed, Some(reason), None);
            report.failed_sessions.push(session.id.clone());
        }

        let ownerless: Vec<TargetName> = self.inner.store.read(|t| {
            t.targets
                .values()
                .filter(|target| {
                    target.state == TargetState::Active
                        && target.attention.is_none()
                        && !t.sessions.values().any(|s| {
                            s.state.is_live() && s.target.as_ref() == Some(&target.name)
                        })
                })
                .map(|target| target.name.clone())
                .collect()
        })?;
        for name in ownerless {
            match self.inner.targets.ensure_inactive(&name).await {
                Ok(()) => report.deactivated_targets.push(name),
                Err(e) => {
                    self.flag(&name, &e);
                }
            }
        }

        report.reconciled = self.inner.targets.reconcile().await?;
        info!(
            "recovery: {} session(s) failed, {} resumed, {} target(s) deactivated, {} orphan(s) removed",
            report.failed_sessions.len(),
            report.resumed_sessions.len(),
            report.deactivated_targets.len(),
            report.reconciled.removed_targets.len() + report.reconciled.removed_backing_stores.len()
        );
        Ok(report)
    }

    /// Periodic liveness sweep until `shutdown` fires.
    pub fn spawn_liveness_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.inner.registry.clone();
        let every = self.inner.liveness_sweep;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.expire_stale(Utc::now()) {
                            warn!("liveness sweep failed: {e}");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("liveness sweeper stopped");
        })
    }
}
