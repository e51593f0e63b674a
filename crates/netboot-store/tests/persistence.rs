//! Persistence of the record tables across store reopen.

use chrono::Utc;
use netboot_store::{
    ConversionJob, Image, ImageFormat, ImageState, JobId, JobState, Machine, MachineId,
    MachineState, Session, SessionState, StateLayout, Store, StoreError, Target, TargetName,
    TargetState,
};
use std::fs;

fn populate(store: &Store) -> Session {
    let session = Session::starting(MachineId::new("M1"), "win11-base".into());
    let out = session.clone();
    store
        .mutate(|t| {
            let now = Utc::now();
            let machine = MachineId::new("M1");
            t.machines.insert(
                machine.clone(),
                Machine::new(machine.clone(), "bench-1", MachineState::Online),
            );
            t.images.insert(
                "win11-base".into(),
                Image {
                    id: "win11-base".into(),
                    format: ImageFormat::Vhdx,
                    source_path: "/srv/upload/win11.vhdx".into(),
                    checksum: Some("abc".to_owned()),
                    export_path: Some("/srv/images/win11-base.img".into()),
                    state: ImageState::Ready,
                    active_job: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            t.put_job(ConversionJob {
                id: JobId::new("job-1"),
                image_id: "win11-base".into(),
                source_format: ImageFormat::Vhdx,
                target_format: ImageFormat::Raw,
                source_path: "/srv/upload/win11.vhdx".into(),
                output_path: "/srv/images/win11-base.img".into(),
                state: JobState::Completed,
                progress: 100,
                attempts: 1,
                error: None,
                created_at: now,
                updated_at: now,
            })?;
            let name = TargetName::for_pair(&machine, &"win11-base".into());
            t.targets.insert(
                name.clone(),
                Target {
                    name,
                    machine_id: machine,
                    image_id: "win11-base".into(),
                    backing_path: "/srv/images/win11-base.img".into(),
                    state: TargetState::Active,
                    attention: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            t.sessions.insert(session.id.clone(), session);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    out
}

#[test]
fn all_tables_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    let (before, session) = {
        let store = Store::open(&layout).unwrap();
        let session = populate(&store);
        (store.snapshot().unwrap(), session)
    };

    let store = Store::open(&layout).unwrap();
    let after = store.snapshot().unwrap();
    assert_eq!(before, after);
    assert_eq!(after.machines.len(), 1);
    assert_eq!(after.images.len(), 1);
    assert_eq!(after.jobs.len(), 1);
    assert_eq!(after.targets.len(), 1);
    let restored = after.session(&session.id).unwrap();
    assert_eq!(restored.state, SessionState::Starting);
}

#[test]
fn corrupted_snapshot_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    {
        let store = Store::open(&layout).unwrap();
        populate(&store);
    }
    let content = fs::read_to_string(layout.snapshot_file()).unwrap();
    fs::write(layout.snapshot_file(), content.replace("bench-1", "bench-2")).unwrap();

    assert!(matches!(
        Store::open(&layout),
        Err(StoreError::IntegrityFailure { .. })
    ));
}

#[test]
fn truncated_snapshot_is_a_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    layout.initialize().unwrap();
    fs::write(layout.snapshot_file(), "{\"format_version\": 1, \"tab").unwrap();
    assert!(matches!(
        Store::open(&layout),
        Err(StoreError::Serialization(_))
    ));
}
