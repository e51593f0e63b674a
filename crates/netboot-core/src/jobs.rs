use crate::events::{EntityKind, EventPublisher};
use crate::lifecycle::validate_job_transition;
use crate::retry::RetryPolicy;
use crate::CoreError;
use chrono::Utc;
use netboot_provision::{ConversionOutcome, ConversionRequest, ImageConverter};
use netboot_store::{ConversionJob, JobId, JobState, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Progress a job must gain over its stored value before it is written.
/// Smaller advances only reach watchers.
const PROGRESS_PERSIST_STEP: u8 = 10;

/// Runs conversion jobs on a bounded worker pool.
///
/// A job waits PENDING until a worker is free. Each invocation submits to
/// the converter and polls it to a terminal status; transient failures are
/// re-invoked on the retry schedule, anything else ends the job FAILED.
/// Progress never goes down, retries included.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    store: Arc<Store>,
    events: Arc<EventPublisher>,
    converter: Arc<dyn ImageConverter>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
    poll_interval: Duration,
    history_retention: usize,
    watchers: Mutex<HashMap<JobId, watch::Sender<ConversionJob>>>,
}

/// Why one invocation failed, and whether another may succeed.
struct InvocationFailure {
    error: String,
    transient: bool,
}

impl JobTracker {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventPublisher>,
        converter: Arc<dyn ImageConverter>,
        workers: usize,
        retry: RetryPolicy,
        poll_interval: Duration,
        history_retention: usize,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                events,
                converter,
                pool: Arc::new(Semaphore::new(workers.max(1))),
                retry,
                poll_interval,
                history_retention,
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue a conversion. Only one non-terminal job may exist per image.
    pub fn submit(&self, request: ConversionRequest) -> Result<ConversionJob, CoreError> {
        let job = self.inner.store.mutate(|t| {
            if let Some(existing) = t.pending_job_for(&request.image_id) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "image {} already has conversion job {} ({})",
                    request.image_id, existing.id, existing.state
                )));
            }
            let now = Utc::now();
            let job = ConversionJob {
                id: JobId::generate(),
                image_id: request.image_id.clone(),
                source_format: request.source_format,
                target_format: request.target_format,
                source_path: request.source_path.clone(),
                output_path: request.output_path.clone(),
                state: JobState::Pending,
                progress: 0,
                attempts: 0,
                error: None,
                created_at: now,
                updated_at: now,
            };
            t.put_job(job.clone())?;
            Ok(job)
        })?;

        self.watchers()
            .insert(job.id.clone(), watch::channel(job.clone()).0);
        info!(
            "queued conversion job {} for image {} ({} -> {})",
            job.id, job.image_id, job.source_format, job.target_format
        );
        self.inner.events.publish(
            EntityKind::Job,
            &job.id,
            job.state,
            Some(format!("image {}", job.image_id)),
        );

        let tracker = self.clone();
        let id = job.id.clone();
        tokio::spawn(async move { tracker.run(id, request).await });
        Ok(job)
    }

    pub fn poll(&self, id: &JobId) -> Result<ConversionJob, CoreError> {
        Ok(self.inner.store.read(|t| t.job(id).cloned())??)
    }

    pub fn list(&self) -> Result<Vec<ConversionJob>, CoreError> {
        Ok(self.inner.store.read(|t| t.jobs.values().cloned().collect())?)
    }

    /// Wait for the job to reach a terminal state.
    pub async fn watch(&self, id: &JobId) -> Result<ConversionJob, CoreError> {
        let rx = self.watchers().get(id).map(watch::Sender::subscribe);
        if let Some(mut rx) = rx {
            if let Ok(job) = rx.wait_for(|j| j.state.is_terminal()).await {
                return Ok(job.clone());
            }
        }
        // Not tracked here, or already finished and dropped.
        self.poll(id)
    }

    /// Fail jobs left PENDING/PROCESSING by a previous process.
    pub fn recover(&self) -> Result<Vec<JobId>, CoreError> {
        let failed = self.inner.store.mutate(|t| {
            let stale: Vec<ConversionJob> = t
                .jobs
                .values()
                .filter(|j| !j.state.is_terminal())
                .cloned()
                .collect();
            let mut ids = Vec::new();
            for mut job in stale {
                job.state = JobState::Failed;
                job.error = Some("interrupted by daemon restart".to_owned());
                job.updated_at = Utc::now();
                ids.push(job.id.clone());
                t.put_job(job)?;
            }
            Ok::<_, CoreError>(ids)
        })?;
        for id in &failed {
            warn!("conversion job {id} was interrupted, marking failed");
            self.inner.events.publish(
                EntityKind::Job,
                id,
                JobState::Failed,
                Some("interrupted".to_owned()),
            );
        }
        Ok(failed)
    }

    fn watchers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<JobId, watch::Sender<ConversionJob>>> {
        match self.inner.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply `f` to the stored job, persist it, notify watchers, and publish
    /// when the state changed.
    fn update(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut ConversionJob) -> Result<(), CoreError>,
    ) -> Result<ConversionJob, CoreError> {
        let seen = self
            .watchers()
            .get(id)
            .map_or(0, |tx| tx.borrow().progress);
        let (before, job, pruned) = self.inner.store.mutate(|t| {
            let mut job = t.job(id)?.clone();
            let before = job.clone();
            f(&mut job)?;
            job.progress = job.progress.max(seen);
            let mut pruned = Vec::new();
            if job != before {
                job.updated_at = Utc::now();
                t.put_job(job.clone())?;
                if job.state.is_terminal() {
                    pruned = t.prune_jobs(self.inner.history_retention);
                }
            }
            Ok::<_, CoreError>((before, job, pruned))
        })?;

        let mut watchers = self.watchers();
        if let Some(tx) = watchers.get(id) {
            tx.send_replace(job.clone());
        }
        if job.state.is_terminal() {
            watchers.remove(id);
        }
        drop(watchers);

        if job.state != before.state {
            self.inner
                .events
                .publish(EntityKind::Job, id, job.state, job.error.clone());
        }
        for old in pruned {
            debug!("conversion job {old} dropped from history");
            self.inner.events.forget(EntityKind::Job, &old);
        }
        Ok(job)
    }

    /// Report converter progress. Watchers see every advance; the stored
    /// record follows in steps of [`PROGRESS_PERSIST_STEP`].
    fn record_progress(&self, id: &JobId, progress: u8) -> Result<(), CoreError> {
        let progress = progress.min(100);
        let seen = self.watchers().get(id).map(|tx| {
            tx.send_if_modified(|job| {
                let advanced = progress > job.progress;
                if advanced {
                    job.progress = progress;
                }
                advanced
            });
            tx.borrow().progress
        });
        let Some(seen) = seen else {
            self.update(id, |job| {
                job.progress = job.progress.max(progress);
                Ok(())
            })?;
            return Ok(());
        };
        let stored = self.poll(id)?.progress;
        if seen >= stored.saturating_add(PROGRESS_PERSIST_STEP) {
            self.update(id, |_| Ok(()))?;
        }
        Ok(())
    }

    fn transition(
        &self,
        id: &JobId,
        to: JobState,
        error: Option<String>,
    ) -> Result<ConversionJob, CoreError> {
        self.update(id, |job| {
            validate_job_transition(job.state, to)?;
            job.state = to;
            job.error = error;
            if to == JobState::Completed {
                job.progress = 100;
            }
            Ok(())
        })
    }

    async fn run(&self, id: JobId, request: ConversionRequest) {
        if let Err(e) = self.drive(&id, &request).await {
            warn!("conversion job {id} aborted: {e}");
            if let Err(e) = self.transition(&id, JobState::Failed, Some(e.to_string())) {
                warn!("could not record failure of job {id}: {e}");
            }
        }
    }

    async fn drive(&self, id: &JobId, request: &ConversionRequest) -> Result<(), CoreError> {
        let _permit = Arc::clone(&self.inner.pool)
            .acquire_owned()
            .await
            .map_err(|_| CoreError::ConversionFailure("conversion pool closed".to_owned()))?;
        self.transition(id, JobState::Processing, None)?;

        let max = self.inner.retry.max_attempts();
        let mut attempt = 1;
        loop {
            self.update(id, |job| {
                job.attempts = attempt;
                Ok(())
            })?;
            match self.invoke(id, request).await {
                Ok(()) => {
                    info!("conversion job {id} completed");
                    self.transition(id, JobState::Completed, None)?;
                    return Ok(());
                }
                Err(failure) if failure.transient && attempt < max => {
                    let delay = self.inner.retry.backoff(attempt);
                    warn!(
                        "conversion job {id} attempt {attempt}/{max} failed, retrying in {delay:?}: {}",
                        failure.error
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    let reason = if failure.transient {
                        format!("{} (gave up after {attempt} attempts)", failure.error)
                    } else {
                        failure.error
                    };
                    warn!("conversion job {id} failed: {reason}");
                    self.transition(id, JobState::Failed, Some(reason))?;
                    return Ok(());
                }
            }
        }
    }

    /// One converter invocation, polled to a terminal status.
    async fn invoke(
        &self,
        id: &JobId,
        request: &ConversionRequest,
    ) -> Result<(), InvocationFailure> {
        let failure = |e: netboot_provision::ProvisionError| InvocationFailure {
            transient: e.is_transient(),
            error: e.to_string(),
        };
        let handle = self.inner.converter.submit(request).await.map_err(failure)?;
        debug!("job {id} running as converter handle {handle}");

        loop {
            tokio::time::sleep(self.inner.poll_interval).await;
            let status = self.inner.converter.poll(&handle).await.map_err(failure)?;
            if let Err(e) = self.record_progress(id, status.progress) {
                warn!("could not record progress of job {id}: {e}");
            }
            match status.outcome {
                ConversionOutcome::Running => {}
                ConversionOutcome::Succeeded => return Ok(()),
                ConversionOutcome::Failed => {
                    return Err(InvocationFailure {
                        error: status
                            .error
                            .unwrap_or_else(|| "conversion failed".to_owned()),
                        transient: status.transient,
                    })
                }
            }
        }
    }
}
