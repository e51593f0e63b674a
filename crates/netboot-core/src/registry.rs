use crate::events::{EntityKind, EventPublisher};
use crate::lifecycle::machine_transitions;
use crate::CoreError;
use chrono::{DateTime, Utc};
use netboot_store::{validate_machine_id, BootStage, Machine, MachineId, MachineState, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Known machines, their boot-stage reports and liveness.
///
/// Also the source of confirmation signals: every `booting`/`online` report
/// and every health-probe `confirm` bumps a per-machine counter that a
/// starting session watches.
#[derive(Clone)]
pub struct MachineRegistry {
    store: Arc<Store>,
    events: Arc<EventPublisher>,
    liveness_timeout: Duration,
    signals: Arc<Mutex<HashMap<MachineId, watch::Sender<u64>>>>,
}

impl MachineRegistry {
    pub fn new(store: Arc<Store>, events: Arc<EventPublisher>, liveness_timeout: Duration) -> Self {
        Self {
            store,
            events,
            liveness_timeout,
            signals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Idempotent. An existing record keeps its state; its display name is
    /// only filled in when empty.
    pub fn register(&self, id: &MachineId, display_name: &str) -> Result<Machine, CoreError> {
        validate_machine_id(id)?;
        let (machine, created) = self.store.mutate(|t| {
            if let Some(existing) = t.machines.get_mut(id) {
                if existing.display_name.is_empty() && !display_name.is_empty() {
                    display_name.clone_into(&mut existing.display_name);
                    existing.updated_at = Utc::now();
                }
                return Ok::<_, CoreError>((existing.clone(), false));
            }
            let machine = Machine::new(id.clone(), display_name, MachineState::Registered);
            t.machines.insert(id.clone(), machine.clone());
            Ok((machine, true))
        })?;
        if created {
            info!("registered machine {id}");
            self.events
                .publish(EntityKind::Machine, id, machine.state, None);
        }
        Ok(machine)
    }

    /// Apply a boot-stage report. Unknown machines are registered as
    /// UNKNOWN. A report older than the last one seen is accepted but
    /// changes nothing.
    pub fn report_boot_event(
        &self,
        id: &MachineId,
        stage: BootStage,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Machine, CoreError> {
        validate_machine_id(id)?;
        let at = timestamp.unwrap_or_else(Utc::now);
        let (machine, discovered, path, stale) = self.store.mutate(|t| {
            let discovered = !t.machines.contains_key(id);
            let machine = t
                .machines
                .entry(id.clone())
                .or_insert_with(|| Machine::new(id.clone(), "", MachineState::Unknown));

            if machine.last_seen.is_some_and(|seen| at < seen) {
                return Ok::<_, CoreError>((machine.clone(), discovered, Vec::new(), true));
            }
            let path = machine_transitions(machine.state, stage);
            if let Some(last) = path.last() {
                machine.state = *last;
            }
            machine.last_stage = Some(stage);
            machine.last_seen = Some(at);
            machine.updated_at = Utc::now();
            Ok((machine.clone(), discovered, path, false))
        })?;

        if discovered {
            info!("discovered machine {id}");
            self.events
                .publish(EntityKind::Machine, id, MachineState::Unknown, None);
        }
        if stale {
            debug!("ignoring out-of-order {stage} report from {id} at {at}");
            return Ok(machine);
        }
        for state in &path {
            self.events.publish(
                EntityKind::Machine,
                id,
                state,
                Some(format!("reported {stage}")),
            );
        }
        if stage.confirms_attach() {
            self.signal(id);
        }
        Ok(machine)
    }

    /// Health-probe confirmation: the machine is up on its network disk.
    pub fn confirm(&self, id: &MachineId) -> Result<Machine, CoreError> {
        let machine = self.get(id)?;
        debug!("health probe confirmed machine {id}");
        self.signal(id);
        Ok(machine)
    }

    /// Receiver for confirmation signals sent from now on.
    pub fn confirmations(&self, id: &MachineId) -> watch::Receiver<u64> {
        let mut signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        signals
            .entry(id.clone())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn signal(&self, id: &MachineId) {
        let mut signals = match self.signals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        signals
            .entry(id.clone())
            .or_insert_with(|| watch::channel(0).0)
            .send_modify(|n| *n += 1);
    }

    /// Liveness sweep: BOOTING/ONLINE machines not heard from within the
    /// timeout go OFFLINE.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<MachineId>, CoreError> {
        let timeout = chrono::Duration::from_std(self.liveness_timeout)
            .map_err(|e| CoreError::Config(format!("liveness timeout out of range: {e}")))?;
        let cutoff = now - timeout;
        let expired = self.store.mutate(|t| {
            let mut expired = Vec::new();
            for machine in t.machines.values_mut() {
                let live = matches!(machine.state, MachineState::Booting | MachineState::Online);
                if live && !machine.last_seen.is_some_and(|seen| seen >= cutoff) {
                    machine.state = MachineState::Offline;
                    machine.updated_at = now;
                    expired.push(machine.id.clone());
                }
            }
            Ok::<_, CoreError>(expired)
        })?;
        for id in &expired {
            info!("machine {id} missed liveness deadline, marking offline");
            self.events.publish(
                EntityKind::Machine,
                id,
                MachineState::Offline,
                Some("liveness timeout".to_owned()),
            );
        }
        Ok(expired)
    }

    pub fn get(&self, id: &MachineId) -> Result<Machine, CoreError> {
        Ok(self.store.read(|t| t.machine(id).cloned())??)
    }

    pub fn list(&self) -> Result<Vec<Machine>, CoreError> {
        Ok(self.store.read(|t| t.machines.values().cloned().collect())?)
    }

    /// Rejected while a session occupies the machine.
    pub fn deregister(&self, id: &MachineId) -> Result<(), CoreError> {
        self.store.mutate(|t| {
            t.machine(id)?;
            if let Some(session) = t.live_session_for(id) {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "machine {id} is in use by session {} ({})",
                    session.id, session.state
                )));
            }
            t.machines.remove(id);
            Ok(())
        })?;
        if let Ok(mut signals) = self.signals.lock() {
            signals.remove(id);
        }
        info!("deregistered machine {id}");
        self.events
            .publish(EntityKind::Machine, id, "removed", None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn registry() -> MachineRegistry {
        MachineRegistry::new(
            Arc::new(Store::in_memory()),
            Arc::new(EventPublisher::new(64, 64)),
            Duration::from_secs(300),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn register_is_idempotent() {
        let r = registry();
        let m1 = MachineId::new("M1");
        let first = r.register(&m1, "").unwrap();
        assert_eq!(first.state, MachineState::Registered);
        r.report_boot_event(&m1, BootStage::Booting, None).unwrap();

        let again = r.register(&m1, "lab-pc-01").unwrap();
        assert_eq!(again.state, MachineState::Booting);
        assert_eq!(again.display_name, "lab-pc-01");
        let third = r.register(&m1, "renamed").unwrap();
        assert_eq!(third.display_name, "lab-pc-01");
        assert_eq!(r.list().unwrap().len(), 1);
    }

    #[test]
    fn register_rejects_bad_identity() {
        let r = registry();
        let err = r.register(&MachineId::new("bad id!"), "x").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn boot_report_auto_registers_and_emits_each_transition() {
        let r = registry();
        let mut rx = r.events.subscribe(EntityKind::Machine);
        let m = MachineId::new("aa:bb:cc:dd:ee:ff");

        let machine = r.report_boot_event(&m, BootStage::Online, Some(at(0))).unwrap();
        assert_eq!(machine.state, MachineState::Online);
        assert_eq!(machine.last_stage, Some(BootStage::Online));

        let states: Vec<String> = (0..3).map(|_| rx.try_recv().unwrap().state).collect();
        assert_eq!(states, vec!["unknown", "booting", "online"]);
    }

    #[test]
    fn out_of_order_report_changes_nothing() {
        let r = registry();
        let m = MachineId::new("M1");
        r.report_boot_event(&m, BootStage::Online, Some(at(10))).unwrap();
        let machine = r
            .report_boot_event(&m, BootStage::Offline, Some(at(5)))
            .unwrap();
        assert_eq!(machine.state, MachineState::Online);
        assert_eq!(machine.last_seen, Some(at(10)));
    }

    #[test]
    fn offline_from_any_state() {
        let r = registry();
        let m = MachineId::new("M1");
        r.register(&m, "").unwrap();
        let machine = r.report_boot_event(&m, BootStage::Offline, None).unwrap();
        assert_eq!(machine.state, MachineState::Offline);
    }

    #[test]
    fn confirmations_fire_on_booting_and_probe() {
        let r = registry();
        let m = MachineId::new("M1");
        r.register(&m, "").unwrap();
        let mut rx = r.confirmations(&m);
        assert!(!rx.has_changed().unwrap());

        r.report_boot_event(&m, BootStage::Offline, None).unwrap();
        assert!(!rx.has_changed().unwrap());
        r.report_boot_event(&m, BootStage::Booting, None).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        r.confirm(&m).unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(r.confirm(&MachineId::new("M9")).is_err());
    }

    #[test]
    fn liveness_sweep_marks_silent_machines_offline() {
        let r = registry();
        let quiet = MachineId::new("M1");
        let chatty = MachineId::new("M2");
        let idle = MachineId::new("M3");
        r.report_boot_event(&quiet, BootStage::Online, Some(at(0))).unwrap();
        r.report_boot_event(&chatty, BootStage::Online, Some(at(290))).unwrap();
        r.register(&idle, "").unwrap();

        let expired = r.expire_stale(at(400)).unwrap();
        assert_eq!(expired, vec![quiet.clone()]);
        assert_eq!(r.get(&quiet).unwrap().state, MachineState::Offline);
        assert_eq!(r.get(&chatty).unwrap().state, MachineState::Online);
        assert_eq!(r.get(&idle).unwrap().state, MachineState::Registered);
    }

    #[test]
    fn deregister_removes_record() {
        let r = registry();
        let m = MachineId::new("M1");
        r.register(&m, "").unwrap();
        r.deregister(&m).unwrap();
        assert!(matches!(r.get(&m), Err(CoreError::NotFound(_))));
        assert!(matches!(r.deregister(&m), Err(CoreError::NotFound(_))));
    }
}
