use crate::events::{EntityKind, EventPublisher};
use crate::CoreError;
use chrono::Utc;
use netboot_provision::{ProvisionError, TargetProvisioner};
use netboot_store::{ImageId, MachineId, Store, Target, TargetName, TargetState};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// External objects removed by [`TargetManager::reconcile`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed_targets: Vec<TargetName>,
    pub removed_backing_stores: Vec<TargetName>,
}

/// Owns the storage-target namespace.
///
/// Provisioning and teardown are serialized by one namespace lock, which
/// makes the "is it already there" checks and the provisioner calls a single
/// step. The manager never retries; callers wrap it in a [`RetryPolicy`].
///
/// [`RetryPolicy`]: crate::RetryPolicy
pub struct TargetManager {
    store: Arc<Store>,
    events: Arc<EventPublisher>,
    provisioner: Arc<dyn TargetProvisioner>,
    namespace: Mutex<()>,
}

fn tolerate(
    result: Result<(), ProvisionError>,
    ok_if: fn(&ProvisionError) -> bool,
) -> Result<(), ProvisionError> {
    match result {
        Err(e) if ok_if(&e) => {
            debug!("tolerated: {e}");
            Ok(())
        }
        other => other,
    }
}

fn already_exists(e: &ProvisionError) -> bool {
    matches!(e, ProvisionError::AlreadyExists(_))
}

impl TargetManager {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventPublisher>,
        provisioner: Arc<dyn TargetProvisioner>,
    ) -> Self {
        Self {
            store,
            events,
            provisioner,
            namespace: Mutex::new(()),
        }
    }

    /// Make the target for (machine, image) ACTIVE on `backing_path`.
    ///
    /// An ACTIVE target is returned as is. Otherwise the backing store is
    /// attached and the target created; if creation fails the backing store
    /// is detached again before the error is returned. A record under the
    /// same name that belongs to another pair is a conflict, never reused.
    pub async fn ensure_active(
        &self,
        machine: &MachineId,
        image: &ImageId,
        backing_path: &Path,
    ) -> Result<Target, CoreError> {
        let _ns = self.namespace.lock().await;
        let name = TargetName::for_pair(machine, image);

        if let Some(existing) = self.store.read(|t| t.targets.get(&name).cloned())? {
            if existing.machine_id != *machine || existing.image_id != *image {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "target {name} belongs to machine {} and image {}",
                    existing.machine_id, existing.image_id
                )));
            }
            if let Some(ref reason) = existing.attention {
                return Err(CoreError::Validation(format!(
                    "target {name} needs operator repair: {reason}"
                )));
            }
            if existing.state == TargetState::Active {
                debug!("target {name} already active");
                return Ok(existing);
            }
        }

        info!("provisioning target {name} on {}", backing_path.display());
        match self
            .provisioner
            .attach_backing_store(&name, backing_path)
            .await
        {
            Err(ProvisionError::AlreadyExists(what)) => {
                // No ACTIVE record owns it, so it is left over and may point
                // at another file.
                warn!("replacing stale backing store for {name}: {what}");
                self.teardown(&name).await?;
                self.provisioner
                    .attach_backing_store(&name, backing_path)
                    .await?;
            }
            other => other?,
        }

        let created = tolerate(self.provisioner.create_target(&name).await, already_exists);
        if let Err(e) = created {
            warn!("creating target {name} failed, detaching backing store: {e}");
            let rollback = tolerate(
                self.provisioner.detach_backing_store(&name).await,
                ProvisionError::is_not_found,
            );
            return Err(match rollback {
                Ok(()) => e.into(),
                Err(rb) => CoreError::PermanentProvisioning {
                    attempts: 1,
                    last_error: format!("{e}; rollback of backing store also failed: {rb}"),
                },
            });
        }

        let target = self.store.mutate(|t| {
            let now = Utc::now();
            let target = t.targets.entry(name.clone()).or_insert_with(|| Target {
                name: name.clone(),
                machine_id: machine.clone(),
                image_id: image.clone(),
                backing_path: backing_path.to_path_buf(),
                state: TargetState::Inactive,
                attention: None,
                created_at: now,
                updated_at: now,
            });
            target.backing_path = backing_path.to_path_buf();
            target.state = TargetState::Active;
            target.updated_at = now;
            Ok::<_, CoreError>(target.clone())
        })?;
        self.events
            .publish(EntityKind::Target, &name, target.state, None);
        Ok(target)
    }

    /// Tear the target down: delete it, then detach its backing store.
    /// Anything already gone is skipped, so unknown names are a no-op.
    pub async fn ensure_inactive(&self, name: &TargetName) -> Result<(), CoreError> {
        let _ns = self.namespace.lock().await;
        self.teardown(name).await
    }

    async fn teardown(&self, name: &TargetName) -> Result<(), CoreError> {
        debug!("tearing down target {name}");
        tolerate(
            self.provisioner.delete_target(name).await,
            ProvisionError::is_not_found,
        )?;
        tolerate(
            self.provisioner.detach_backing_store(name).await,
            ProvisionError::is_not_found,
        )?;

        let changed = self.store.mutate(|t| {
            let Some(target) = t.targets.get_mut(name) else {
                return Ok::<_, CoreError>(false);
            };
            if target.state == TargetState::Inactive && target.attention.is_none() {
                return Ok(false);
            }
            target.state = TargetState::Inactive;
            target.attention = None;
            target.updated_at = Utc::now();
            Ok(true)
        })?;
        if changed {
            info!("target {name} inactive");
            self.events
                .publish(EntityKind::Target, name, TargetState::Inactive, None);
        }
        Ok(())
    }

    /// Leave the target ACTIVE but flag it for an operator.
    pub fn mark_attention(&self, name: &TargetName, reason: &str) -> Result<Target, CoreError> {
        let target = self.store.mutate(|t| {
            let target = t.target_mut(name)?;
            target.attention = Some(reason.to_owned());
            target.updated_at = Utc::now();
            Ok::<_, CoreError>(target.clone())
        })?;
        warn!("target {name} needs attention: {reason}");
        self.events.publish(
            EntityKind::Target,
            name,
            "attention",
            Some(reason.to_owned()),
        );
        Ok(target)
    }

    /// Operator recovery: run the teardown again and clear the flag.
    pub async fn repair(&self, name: &TargetName) -> Result<Target, CoreError> {
        self.get(name)?;
        info!("repairing target {name}");
        self.ensure_inactive(name).await?;
        self.get(name)
    }

    pub fn get(&self, name: &TargetName) -> Result<Target, CoreError> {
        Ok(self.store.read(|t| t.target(name).cloned())??)
    }

    pub fn list(&self) -> Result<Vec<Target>, CoreError> {
        Ok(self.store.read(|t| t.targets.values().cloned().collect())?)
    }

    /// Remove external targets and backing stores no ACTIVE record owns.
    /// Names are compared case-insensitively, as target IQNs are lowercase.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CoreError> {
        let _ns = self.namespace.lock().await;
        let owned: HashSet<String> = self.store.read(|t| {
            t.targets
                .values()
                .filter(|target| target.state == TargetState::Active)
                .map(|target| target.name.to_ascii_lowercase())
                .collect()
        })?;
        let is_orphan = |name: &TargetName| !owned.contains(&name.to_ascii_lowercase());

        let mut report = ReconcileReport::default();
        for name in self.provisioner.list_targets().await? {
            if is_orphan(&name) {
                warn!("removing orphaned target {name}");
                tolerate(
                    self.provisioner.delete_target(&name).await,
                    ProvisionError::is_not_found,
                )?;
                report.removed_targets.push(name);
            }
        }
        for name in self.provisioner.list_backing_stores().await? {
            if is_orphan(&name) {
                warn!("removing orphaned backing store {name}");
                tolerate(
                    self.provisioner.detach_backing_store(&name).await,
                    ProvisionError::is_not_found,
                )?;
                report.removed_backing_stores.push(name);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netboot_provision::{Fault, MockOp, MockProvisioner};

    fn manager() -> (Arc<MockProvisioner>, TargetManager) {
        let mock = Arc::new(MockProvisioner::new());
        let manager = TargetManager::new(
            Arc::new(Store::in_memory()),
            Arc::new(EventPublisher::new(64, 64)),
            Arc::clone(&mock) as Arc<dyn TargetProvisioner>,
        );
        (mock, manager)
    }

    fn pair() -> (MachineId, ImageId) {
        (MachineId::new("M1"), ImageId::new("win11-base"))
    }

    #[tokio::test]
    async fn ensure_active_twice_creates_once() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let first = m
            .ensure_active(&machine, &image, Path::new("/srv/win11.img"))
            .await
            .unwrap();
        let second = m
            .ensure_active(&machine, &image, Path::new("/srv/win11.img"))
            .await
            .unwrap();

        assert_eq!(first.name, TargetName::for_pair(&machine, &image));
        assert_eq!(second.state, TargetState::Active);
        assert_eq!(mock.calls(MockOp::Create), 1);
        assert_eq!(mock.calls(MockOp::Attach), 1);
        assert_eq!(m.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_create_detaches_backing_store() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        mock.fail_always(MockOp::Create, Fault::Permanent);

        let err = m
            .ensure_active(&machine, &image, Path::new("/srv/win11.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermanentProvisioning { .. }));
        let name = TargetName::for_pair(&machine, &image);
        assert!(!mock.has_backing_store(&name));
        assert!(!mock.has_target(&name));
        assert!(m.get(&name).is_err());
    }

    #[tokio::test]
    async fn failed_rollback_names_both_failures() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        mock.fail_always(MockOp::Create, Fault::Transient);
        mock.fail_always(MockOp::Detach, Fault::Permanent);

        let err = m
            .ensure_active(&machine, &image, Path::new("/srv/win11.img"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        let text = err.to_string();
        assert!(text.contains("Create"));
        assert!(text.contains("rollback"));
    }

    #[tokio::test]
    async fn transient_create_failure_stays_transient() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        mock.fail_next(MockOp::Create, Fault::Transient, 1);
        let err = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        m.ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn activate_then_deactivate_leaves_namespace_empty() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let target = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap();
        m.ensure_inactive(&target.name).await.unwrap();

        assert!(mock.list_targets().await.unwrap().is_empty());
        assert!(mock.list_backing_stores().await.unwrap().is_empty());
        assert_eq!(m.get(&target.name).unwrap().state, TargetState::Inactive);

        m.ensure_inactive(&target.name).await.unwrap();
        m.ensure_inactive(&TargetName::new("never-created")).await.unwrap();
    }

    #[tokio::test]
    async fn attention_blocks_reuse_until_repaired() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let target = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap();
        m.mark_attention(&target.name, "delete failed").unwrap();

        let err = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let repaired = m.repair(&target.name).await.unwrap();
        assert_eq!(repaired.state, TargetState::Inactive);
        assert!(repaired.attention.is_none());
        assert!(!mock.has_target(&target.name));
        m.ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn record_of_another_pair_is_never_reused() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let name = TargetName::for_pair(&machine, &image);
        m.store
            .mutate(|t| {
                let now = Utc::now();
                t.targets.insert(
                    name.clone(),
                    Target {
                        name: name.clone(),
                        machine_id: MachineId::new("M2"),
                        image_id: image.clone(),
                        backing_path: "/other.img".into(),
                        state: TargetState::Active,
                        attention: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok::<_, CoreError>(())
            })
            .unwrap();

        let err = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ConcurrencyConflict(_)), "{err}");
        assert_eq!(mock.calls(MockOp::Attach), 0);
        assert_eq!(m.get(&name).unwrap().machine_id, "M2");
    }

    #[tokio::test]
    async fn stale_backing_store_is_replaced_not_adopted() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let name = TargetName::for_pair(&machine, &image);
        mock.insert_existing(&name, Path::new("/left-over.img"));

        let target = m
            .ensure_active(&machine, &image, Path::new("/srv/win11.img"))
            .await
            .unwrap();
        assert_eq!(target.state, TargetState::Active);
        assert_eq!(mock.backing_path(&name).as_deref(), Some(Path::new("/srv/win11.img")));
        assert!(mock.has_target(&name));
    }

    #[tokio::test]
    async fn reconcile_removes_orphans_only() {
        let (mock, m) = manager();
        let (machine, image) = pair();
        let kept = m
            .ensure_active(&machine, &image, Path::new("/a"))
            .await
            .unwrap();
        let orphan = TargetName::new("M7-old-image");
        mock.insert_existing(&orphan, Path::new("/old.img"));

        let report = m.reconcile().await.unwrap();
        assert_eq!(report.removed_targets, vec![orphan.clone()]);
        assert_eq!(report.removed_backing_stores, vec![orphan.clone()]);
        assert!(mock.has_target(&kept.name));
        assert!(!mock.has_target(&orphan));
    }
}
