mod common;

use std::sync::Arc;
use std::time::Duration;

use arkfleet::config::{GlobalConfig, LifecycleConfig};
use arkfleet::runtime::{
    generate, FsSnapshotStore, LifecycleError, LifecycleOrchestrator, LifecycleOutcome, ServerState,
};
use common::{server, RecordingSupervisor};
use tempfile::TempDir;

fn orchestrator(sup: &Arc<RecordingSupervisor>, dir: &TempDir) -> Arc<LifecycleOrchestrator> {
    Arc::new(LifecycleOrchestrator::new(
        sup.clone(),
        Arc::new(FsSnapshotStore::new(dir.path().join("servers"), dir.path().join("backups"))),
        LifecycleConfig::default(),
    ))
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{} not in {:?}", call, calls))
}

#[tokio::test]
async fn stop_saves_before_stopping_even_when_save_fails() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Running)]);
    sup.fail("exec:s1");
    let orch = orchestrator(&sup, &dir);

    let outcome = orch.stop("s1").await.unwrap();

    assert_eq!(outcome, LifecycleOutcome::Applied);
    let calls = sup.calls();
    assert!(position(&calls, "exec(SaveWorld):s1") < position(&calls, "stop:s1"));
    assert_eq!(sup.state("s1"), Some(ServerState::Stopped));
    assert_eq!(orch.cached_state("s1"), Some(ServerState::Stopped));
}

#[tokio::test]
async fn start_of_running_server_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Running)]);
    let orch = orchestrator(&sup, &dir);

    assert_eq!(orch.start("s1").await.unwrap(), LifecycleOutcome::AlreadyInState);
    assert!(!sup.calls().iter().any(|c| c.starts_with("start")));
}

#[tokio::test]
async fn restart_reports_incomplete_when_start_fails() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Running)]);
    sup.fail("start:s1");
    let orch = orchestrator(&sup, &dir);

    let err = orch.restart("s1").await.unwrap_err();

    assert!(matches!(err, LifecycleError::RestartIncomplete { ref name, .. } if name == "s1"));
    assert_eq!(sup.state("s1"), Some(ServerState::Stopped));
    assert_eq!(orch.cached_state("s1"), Some(ServerState::Stopped));
}

#[tokio::test]
async fn bulk_update_keeps_going_past_failures() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[
        ("s1", ServerState::Running),
        ("s2", ServerState::Running),
        ("s3", ServerState::Running),
    ]);
    sup.fail("provision:s2");
    let orch = orchestrator(&sup, &dir);

    let global = GlobalConfig::default();
    let items: Vec<_> = ["s1", "s2", "s3"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let spec = server(name, i as u16);
            let artifact = generate(&spec, &global);
            (spec, artifact)
        })
        .collect();

    let reported = std::sync::Mutex::new(Vec::new());
    let result = orch
        .update_all(&items, |done, total| reported.lock().unwrap().push((done, total)))
        .await;

    assert_eq!(result.successful, vec!["s1".to_string(), "s3".to_string()]);
    assert_eq!(result.failed_names(), vec!["s2"]);
    assert_eq!(result.total_processed, 3);
    assert_eq!(reported.into_inner().unwrap().last(), Some(&(3, 3)));

    let calls = sup.calls();
    for name in ["s1", "s3"] {
        let provision = position(&calls, &format!("provision:{}", name));
        let stop = position(&calls, &format!("stop:{}", name));
        let start = position(&calls, &format!("start:{}", name));
        assert!(stop < provision && provision < start, "{:?}", calls);
        assert_eq!(sup.state(name), Some(ServerState::Running));
    }
    assert!(!calls.contains(&"start:s2".to_string()));
}

#[tokio::test]
async fn timed_out_start_leaves_state_unknown() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Stopped)]);
    sup.set_delay(Duration::from_secs(2));
    let orch = orchestrator(&sup, &dir);

    let err = orch
        .start_with_timeout("s1", Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::OperationTimedOut { operation: "start", .. }));
    assert_eq!(orch.cached_state("s1"), Some(ServerState::Unknown));
}

#[tokio::test]
async fn operations_on_one_server_never_overlap() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Stopped)]);
    sup.set_delay(Duration::from_millis(30));
    let orch = orchestrator(&sup, &dir);

    let (a, b, c) = tokio::join!(orch.start("s1"), orch.stop("s1"), orch.start("s1"));
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(sup.max_concurrent_per_name(), 1);
}

#[tokio::test]
async fn different_servers_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    let sup = RecordingSupervisor::with_servers(&[
        ("s1", ServerState::Stopped),
        ("s2", ServerState::Stopped),
    ]);
    sup.set_delay(Duration::from_millis(200));
    let orch = orchestrator(&sup, &dir);

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(orch.start("s1"), orch.start("s2"));
    a.unwrap();
    b.unwrap();

    assert!(started.elapsed() < Duration::from_millis(390));
    assert_eq!(sup.state("s2"), Some(ServerState::Running));
}

#[tokio::test]
async fn restore_refuses_running_server_unless_asked_to_stop() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("servers").join("s1").join("ShooterGame");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("world.ark"), "v1").unwrap();

    let sup = RecordingSupervisor::with_servers(&[("s1", ServerState::Running)]);
    let orch = orchestrator(&sup, &dir);

    let backup = orch.backup("s1", Some("before-wipe")).await.unwrap();
    assert!(sup.calls().contains(&"exec(SaveWorld):s1".to_string()));
    std::fs::write(data.join("world.ark"), "v2").unwrap();

    let err = orch
        .restore("s1", &backup.id, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::ServerRunning(_)));

    let options = arkfleet::runtime::RestoreOptions {
        stop_first: true,
        start_after: true,
    };
    orch.restore("s1", &backup.id, options).await.unwrap();

    assert_eq!(std::fs::read_to_string(data.join("world.ark")).unwrap(), "v1");
    assert_eq!(sup.state("s1"), Some(ServerState::Running));
}
