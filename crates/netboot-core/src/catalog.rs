use crate::events::{EntityKind, EventPublisher};
use crate::jobs::JobTracker;
use crate::lifecycle::validate_image_transition;
use crate::CoreError;
use chrono::Utc;
use netboot_provision::ConversionRequest;
use netboot_store::{
    validate_image_name, ConversionJob, Image, ImageFormat, ImageId, ImageState, JobState,
    StateLayout, Store,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// What a caller supplies to register a new image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSpec {
    pub name: ImageId,
    pub format: ImageFormat,
    pub source_path: PathBuf,
}

/// blake3 hex digest of a file's contents.
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Uploaded images and their way to READY.
///
/// An image becomes READY only after its conversion job (when the format
/// needs one) completed and the source checksum verified. Failures leave it
/// in ERROR with a reason; nothing is retried until `resubmit`.
#[derive(Clone)]
pub struct ImageCatalog {
    store: Arc<Store>,
    events: Arc<EventPublisher>,
    tracker: JobTracker,
    layout: StateLayout,
}

impl ImageCatalog {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventPublisher>,
        tracker: JobTracker,
        layout: StateLayout,
    ) -> Self {
        Self {
            store,
            events,
            tracker,
            layout,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn create(&self, spec: ImageSpec) -> Result<Image, CoreError> {
        validate_image_name(&spec.name)?;
        let image = self.store.mutate(|t| {
            if t.images.contains_key(&spec.name) {
                return Err(CoreError::Validation(format!(
                    "image {} already exists",
                    spec.name
                )));
            }
            let now = Utc::now();
            let image = Image {
                id: spec.name.clone(),
                format: spec.format,
                source_path: spec.source_path.clone(),
                checksum: None,
                export_path: None,
                state: ImageState::Uploading,
                active_job: None,
                error: None,
                created_at: now,
                updated_at: now,
            };
            t.images.insert(image.id.clone(), image.clone());
            Ok(image)
        })?;
        info!("created image {} ({})", image.id, image.format);
        self.events
            .publish(EntityKind::Image, &image.id, image.state, None);
        Ok(image)
    }

    /// The upload finished. `checksum` is what the uploader computed; when
    /// absent the digest of the file as found is recorded instead.
    pub async fn mark_uploaded(
        &self,
        id: &ImageId,
        checksum: Option<String>,
    ) -> Result<Image, CoreError> {
        let image = self.store.mutate(|t| {
            let image = t.image_mut(id)?;
            if image.state != ImageState::Uploading {
                return Err(CoreError::Validation(format!(
                    "image {id} is {}, expected uploading",
                    image.state
                )));
            }
            validate_image_transition(image.state, ImageState::Processing)?;
            image.checksum = checksum.map(|c| c.to_ascii_lowercase());
            image.state = ImageState::Processing;
            image.updated_at = Utc::now();
            Ok(image.clone())
        })?;
        self.events
            .publish(EntityKind::Image, id, image.state, Some("uploaded".to_owned()));
        self.process(image).await
    }

    /// Explicit retry of an image in ERROR.
    pub async fn resubmit(&self, id: &ImageId) -> Result<Image, CoreError> {
        let image = self.store.mutate(|t| {
            let image = t.image_mut(id)?;
            if image.state != ImageState::Error {
                return Err(CoreError::Validation(format!(
                    "image {id} is {}, only failed images can be resubmitted",
                    image.state
                )));
            }
            validate_image_transition(image.state, ImageState::Processing)?;
            image.state = ImageState::Processing;
            image.error = None;
            image.active_job = None;
            image.updated_at = Utc::now();
            Ok(image.clone())
        })?;
        info!("resubmitting image {id}");
        self.events.publish(
            EntityKind::Image,
            id,
            image.state,
            Some("resubmitted".to_owned()),
        );
        self.process(image).await
    }

    async fn process(&self, image: Image) -> Result<Image, CoreError> {
        if !image.format.requires_conversion() {
            let outcome = self
                .verify(&image)
                .await
                .map(|sum| (sum, image.source_path.clone()));
            return self.finish(&image.id, outcome);
        }

        let request = ConversionRequest {
            image_id: image.id.clone(),
            source_format: image.format,
            target_format: ImageFormat::Raw,
            source_path: image.source_path.clone(),
            output_path: self.layout.export_path(&image.id),
        };
        let job = match self.tracker.submit(request) {
            Ok(job) => job,
            Err(e) => {
                self.finish(&image.id, Err(format!("could not queue conversion: {e}")))?;
                return Err(e);
            }
        };
        let image = self.store.mutate(|t| {
            let image = t.image_mut(&image.id)?;
            image.active_job = Some(job.id.clone());
            image.updated_at = Utc::now();
            Ok::<_, CoreError>(image.clone())
        })?;

        let catalog = self.clone();
        tokio::spawn(async move {
            match catalog.tracker.watch(&job.id).await {
                Ok(job) => {
                    if let Err(e) = catalog.on_job_terminal(&job).await {
                        warn!("finishing image {} after job {} failed: {e}", job.image_id, job.id);
                    }
                }
                Err(e) => warn!("lost track of conversion job {}: {e}", job.id),
            }
        });
        Ok(image)
    }

    /// Settle the image that owns `job`. Jobs that no longer own their image
    /// (superseded by a resubmit) are ignored.
    pub async fn on_job_terminal(&self, job: &ConversionJob) -> Result<Image, CoreError> {
        let image = self.get(&job.image_id)?;
        if image.state != ImageState::Processing || image.active_job.as_ref() != Some(&job.id) {
            debug!("job {} no longer owns image {}", job.id, image.id);
            return Ok(image);
        }
        let outcome = match job.state {
            JobState::Completed => self
                .verify(&image)
                .await
                .map(|sum| (sum, job.output_path.clone())),
            JobState::Failed => Err(job
                .error
                .clone()
                .unwrap_or_else(|| "conversion failed".to_owned())),
            JobState::Pending | JobState::Processing => return Ok(image),
        };
        self.finish(&image.id, outcome)
    }

    /// Hash the source on a blocking thread and compare to the recorded sum.
    async fn verify(&self, image: &Image) -> Result<String, String> {
        let path = image.source_path.clone();
        let actual = tokio::task::spawn_blocking(move || checksum_file(&path))
            .await
            .map_err(|e| format!("checksum task failed: {e}"))?
            .map_err(|e| format!("reading {}: {e}", image.source_path.display()))?;
        match image.checksum {
            Some(ref expected) if *expected != actual => Err(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            )),
            _ => Ok(actual),
        }
    }

    fn finish(
        &self,
        id: &ImageId,
        outcome: Result<(String, PathBuf), String>,
    ) -> Result<Image, CoreError> {
        let image = self.store.mutate(|t| {
            let image = t.image_mut(id)?;
            if image.state != ImageState::Processing {
                return Ok::<_, CoreError>(image.clone());
            }
            match outcome {
                Ok((checksum, export_path)) => {
                    validate_image_transition(image.state, ImageState::Ready)?;
                    image.state = ImageState::Ready;
                    image.checksum = Some(checksum);
                    image.export_path = Some(export_path);
                    image.error = None;
                }
                Err(reason) => {
                    validate_image_transition(image.state, ImageState::Error)?;
                    image.state = ImageState::Error;
                    image.error = Some(reason);
                }
            }
            image.active_job = None;
            image.updated_at = Utc::now();
            Ok(image.clone())
        })?;
        match image.state {
            ImageState::Ready => info!("image {id} is ready"),
            ImageState::Error => warn!(
                "image {id} failed: {}",
                image.error.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }
        self.events
            .publish(EntityKind::Image, id, image.state, image.error.clone());
        Ok(image)
    }

    /// Wait until the image is READY. ERROR is returned as `ConversionFailure`.
    pub async fn wait_settled(&self, id: &ImageId, timeout: Duration) -> Result<Image, CoreError> {
        let mut rx = self.events.subscribe(EntityKind::Image);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let image = self.get(id)?;
            match image.state {
                ImageState::Ready => return Ok(image),
                ImageState::Error => {
                    return Err(CoreError::ConversionFailure(
                        image.error.unwrap_or_else(|| "unknown error".to_owned()),
                    ))
                }
                ImageState::Uploading | ImageState::Processing => {}
            }
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(_) | Err(RecvError::Lagged(_))) => {}
                Ok(Err(RecvError::Closed)) => {
                    return Err(CoreError::Timeout("event channel closed".to_owned()))
                }
                Err(_) => {
                    return Err(CoreError::Timeout(format!(
                        "image {id} still {} after {timeout:?}",
                        image.state
                    )))
                }
            }
        }
    }

    pub fn get(&self, id: &ImageId) -> Result<Image, CoreError> {
        Ok(self.store.read(|t| t.image(id).cloned())??)
    }

    pub fn list(&self) -> Result<Vec<Image>, CoreError> {
        Ok(self.store.read(|t| t.images.values().cloned().collect())?)
    }

    /// Rejected while a session uses the image or a conversion is running.
    pub fn remove(&self, id: &ImageId) -> Result<Image, CoreError> {
        let image = self.store.mutate(|t| {
            let image = t.image(id)?.clone();
            if t.image_in_use(id) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "image {id} is referenced by a live session"
                )));
            }
            if let Some(job) = t.pending_job_for(id) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "image {id} has conversion job {} in progress",
                    job.id
                )));
            }
            t.images.remove(id);
            Ok(image)
        })?;

        if let Some(ref export) = image.export_path {
            if *export != image.source_path && export.starts_with(self.layout.images_dir()) {
                match std::fs::remove_file(export) {
                    Ok(()) => debug!("removed {}", export.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to remove {}: {e}", export.display()),
                }
            }
        }
        info!("removed image {id}");
        self.events.publish(EntityKind::Image, id, "removed", None);
        Ok(image)
    }

    /// Images caught PROCESSING by a restart go to ERROR; resubmit retries them.
    pub fn recover(&self) -> Result<Vec<ImageId>, CoreError> {
        let failed = self.store.mutate(|t| {
            let mut failed = Vec::new();
            for image in t.images.values_mut() {
                if image.state == ImageState::Processing {
                    image.state = ImageState::Error;
                    image.error = Some("processing interrupted by daemon restart".to_owned());
                    image.active_job = None;
                    image.updated_at = Utc::now();
                    failed.push(image.id.clone());
                }
            }
            Ok::<_, CoreError>(failed)
        })?;
        for id in &failed {
            self.events.publish(
                EntityKind::Image,
                id,
                ImageState::Error,
                Some("interrupted".to_owned()),
            );
        }
        Ok(failed)
    }
}
