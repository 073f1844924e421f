use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use supervisor_core::process::testing::FakeProcess;
use supervisor_core::testing::StubPreparable;
use supervisor_core::{ConfigStore, ProcessFactory, SupervisedProcess, Supervisor, SupervisorError};

/// A factory that also hands the test a clone of the last handle it built,
/// so the test can simulate an out-of-band kill the way a real signal would
/// arrive (the Supervisor itself never exposes raw handles).
fn fake_factory_with_handle() -> (ProcessFactory, Arc<Mutex<Option<FakeProcess>>>) {
    let slot = Arc::new(Mutex::new(None));
    let slot_for_factory = slot.clone();
    let counter = Arc::new(AtomicU32::new(500));
    let factory: ProcessFactory = Arc::new(move || {
        let pid = counter.fetch_add(1, Ordering::SeqCst);
        let fake = FakeProcess::new(pid);
        *slot_for_factory.lock().unwrap() = Some(fake.clone());
        Arc::new(fake) as Arc<dyn SupervisedProcess>
    });
    (factory, slot)
}

async fn fresh_supervisor(dir: &std::path::Path, factory: ProcessFactory) -> Arc<Supervisor> {
    std::fs::write(dir.join("config.toml"), "").unwrap();
    Supervisor::init(
        dir.to_path_buf(),
        dir.join("main.pid"),
        dir.join("main.out"),
        dir.join("main.err"),
        Arc::new(StubPreparable::default()),
        factory,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn already_exists_keeps_registry_at_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, _handles) = fake_factory_with_handle();
    let supervisor = fresh_supervisor(dir.path(), factory).await;

    supervisor
        .prepare_and_run(PathBuf::from("./sleeper"), "a".to_string(), false, vec!["30".into()])
        .await
        .unwrap();

    let err = supervisor
        .prepare_and_run(PathBuf::from("./sleeper"), "a".to_string(), false, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyExists { name } if name == "a"));
    assert_eq!(supervisor.list().await.len(), 1);
}

#[tokio::test]
async fn external_kill_restarts_keep_alive_process_with_new_pid() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, handle_slot) = fake_factory_with_handle();
    let supervisor = fresh_supervisor(dir.path(), factory).await;
    supervisor.spawn_background_tasks();

    supervisor
        .prepare_and_run(PathBuf::from("./sleeper"), "a".to_string(), true, vec![])
        .await
        .unwrap();

    let before = supervisor.list().await;
    assert!(before[0].pid.is_some());
    assert_eq!(before[0].restart_count, 0);

    let handle = handle_slot.lock().unwrap().clone().expect("a handle was built");
    handle.kill_externally(Some(9)).await;

    // Let the Watcher publish the exit and the supervise loop react.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after = supervisor.list().await;
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].restart_count, 1, "exactly one restart for the single exit");
    assert!(after[0].pid.is_some(), "keep-alive process must be running again");
}

#[tokio::test]
async fn stop_suppresses_restart_even_with_keep_alive() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, _handles) = fake_factory_with_handle();
    let supervisor = fresh_supervisor(dir.path(), factory).await;
    supervisor.spawn_background_tasks();

    supervisor
        .prepare_and_run(PathBuf::from("./sleeper"), "a".to_string(), true, vec![])
        .await
        .unwrap();

    supervisor.stop("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = supervisor.list().await;
    assert_eq!(status[0].restart_count, 0, "Stop must not be counted as a restart");
    assert!(status[0].pid.is_none());
}

#[tokio::test]
async fn persistence_round_trip_across_supervisor_instances() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (factory, _handles) = fake_factory_with_handle();
        let supervisor = fresh_supervisor(dir.path(), factory).await;
        supervisor
            .prepare_and_run(PathBuf::from("./sleeper"), "b".to_string(), true, vec![])
            .await
            .unwrap();
    }

    let reloaded = ConfigStore::read_into(&dir.path().join("config.toml")).unwrap();
    assert!(reloaded.procs["b"].spec.keep_alive);

    let (factory, _handles) = fake_factory_with_handle();
    let supervisor = Supervisor::init(
        dir.path().to_path_buf(),
        dir.path().join("main.pid"),
        dir.path().join("main.out"),
        dir.path().join("main.err"),
        Arc::new(StubPreparable::default()),
        factory,
    )
    .await
    .unwrap();

    let status = supervisor.list().await;
    let entry = status.iter().find(|p| p.name == "b").expect("revived process present");
    assert!(entry.pid.is_some());
    assert!(entry.keep_alive);
}

#[tokio::test]
async fn delete_cleans_artifacts_and_config_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (factory, _handles) = fake_factory_with_handle();
    let supervisor = fresh_supervisor(dir.path(), factory).await;

    supervisor
        .prepare_and_run(PathBuf::from("./sleeper"), "c".to_string(), false, vec![])
        .await
        .unwrap();
    assert!(dir.path().join("c").exists());

    supervisor.delete("c").await.unwrap();
    assert!(!dir.path().join("c").exists());

    let reloaded = ConfigStore::read_into(&dir.path().join("config.toml")).unwrap();
    assert!(!reloaded.procs.contains_key("c"));
}
