use std::sync::Arc;
use std::time::Duration;

use aki_launcher_service::notify::Severity;
use aki_launcher_service::process::{
    AkiServerService, ManagedProcess, ProcessService, RunningState, SystemProcessTable,
    SERVER_EXECUTABLE,
};
use aki_launcher_service::requests::{HttpServerRequester, ServerRequester};

use crate::{
    dummy_executable, next_state, ping_server, setup_config, states_until_exit,
    write_http_config, FakeTable, PingResponse, RecordingNotifier, ScriptedRequester,
    StubRequester,
};

fn server_service(
    config: aki_launcher_service::config::SharedConfig,
    requester: Arc<dyn ServerRequester>,
) -> (AkiServerService, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let service = AkiServerService::new(config, requester, notifier.clone());
    (service, notifier)
}

#[tokio::test]
async fn test_heartbeat_failure_kills_server() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let (service, _) = server_service(config, Arc::new(StubRequester::Failing));
    let mut states = service.subscribe();

    service.start(&[]).unwrap();

    let seen = states_until_exit(&mut states).await;
    assert_eq!(seen, [RunningState::Starting, RunningState::NotRunning]);
    assert_eq!(service.process().pid(), None);
}

#[tokio::test]
async fn test_heartbeat_sentinel_kills_server() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let (service, _) = server_service(config, Arc::new(StubRequester::Sentinel));
    let mut states = service.subscribe();
    let mut started = service.subscribe_started();

    service.start(&[]).unwrap();

    let seen = states_until_exit(&mut states).await;
    assert_eq!(seen, [RunningState::Starting, RunningState::NotRunning]);
    assert!(started.try_recv().is_err());
}

#[tokio::test]
async fn test_server_exits_before_heartbeat() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exit 3");
    let requester = StubRequester::Pong(Duration::from_millis(500));
    let (service, _) = server_service(config, Arc::new(requester));
    let mut states = service.subscribe();
    let mut started = service.subscribe_started();

    service.start(&[]).unwrap();

    let seen = states_until_exit(&mut states).await;
    assert_eq!(seen, [RunningState::Starting, RunningState::NotRunning]);

    // the late heartbeat must not revive the server
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(service.state(), RunningState::NotRunning);
    assert!(started.try_recv().is_err());
}

#[tokio::test]
async fn test_heartbeat_against_stub_server() {
    let (config, dir) = setup_config(|_| {});
    let server_dir = dir.path().join("server");
    dummy_executable(&server_dir, SERVER_EXECUTABLE, "exec sleep 30");
    let stub = ping_server(PingResponse::Pong);
    write_http_config(&server_dir, stub.addr());

    let requester = HttpServerRequester::new(Duration::from_secs(5)).unwrap();
    let (service, _) = server_service(config, Arc::new(requester));
    let mut states = service.subscribe();
    let mut started = service.subscribe_started();

    service.start(&[]).unwrap();

    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    assert_eq!(next_state(&mut states).await, RunningState::Running);
    let event = started.recv().await.unwrap();
    assert_eq!(event.address, stub.addr());
    assert_eq!(service.address(), Some(stub.addr()));

    assert!(service.stop().await);
    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);
}

#[tokio::test]
async fn test_running_server_crash() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let (service, _) = server_service(config, Arc::new(StubRequester::Pong(Duration::ZERO)));
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    assert_eq!(next_state(&mut states).await, RunningState::Running);

    let pid = service.process().pid().unwrap();
    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();

    assert_eq!(
        next_state(&mut states).await,
        RunningState::StoppedUnexpectedly
    );
}

#[tokio::test]
async fn test_server_output_is_retained() {
    let (config, dir) = setup_config(|_| {});
    let body = "echo 'Server is starting'\necho 'Server is running'\nexec sleep 30";
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, body);
    let (service, _) = server_service(config, Arc::new(StubRequester::Pong(Duration::ZERO)));

    service.start(&[]).unwrap();

    let expected = vec![
        "Server is starting".to_owned(),
        "Server is running".to_owned(),
    ];
    tokio::time::timeout(Duration::from_secs(10), async {
        while service.cached_output() != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(service.stop().await);
}

#[tokio::test]
async fn test_server_output_goes_live() {
    let (config, dir) = setup_config(|_| {});
    let body = "sleep 1\necho 'live line'\nexec sleep 30";
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, body);
    let (service, _) = server_service(config, Arc::new(StubRequester::Pong(Duration::ZERO)));
    let mut output = service.subscribe_output();

    service.start(&[]).unwrap();

    let line = tokio::time::timeout(Duration::from_secs(10), output.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "live line");
    assert!(service.cached_output().is_empty());

    assert!(service.stop().await);
}

#[tokio::test]
async fn test_output_not_captured_when_closing_after_launch() {
    let (config, dir) = setup_config(|config| config.close_after_launch = true);
    let body = "echo 'to the terminal'\nexec sleep 30";
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, body);
    let (service, _) = server_service(config, Arc::new(StubRequester::Pong(Duration::ZERO)));
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    assert_eq!(next_state(&mut states).await, RunningState::Running);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(service.cached_output().is_empty());
    assert!(service.stop().await);
}

#[tokio::test]
async fn test_clear_server_cache() {
    let (config, dir) = setup_config(|_| {});
    let cache_dir = dir.path().join("server/user/cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    std::fs::write(cache_dir.join("mods.json"), b"{}").unwrap();
    let (service, notifier) = server_service(config.clone(), Arc::new(StubRequester::Failing));

    service.clear_cache().unwrap();

    assert!(cache_dir.is_dir());
    assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 0);

    config.update(|config| config.server.install_path = None);
    assert!(service.clear_cache().is_err());

    assert_eq!(
        *notifier.notifications.lock(),
        vec![("Server cache".to_owned(), Severity::Success)]
    );
}

#[tokio::test]
async fn test_unhandled_server_instance() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let table = Arc::new(FakeTable::with_pids(vec![4242, 4343]));
    let service = AkiServerService::with_process_table(
        config,
        Arc::new(StubRequester::Pong(Duration::ZERO)),
        Arc::new(RecordingNotifier::default()),
        table.clone(),
    );

    // two servers share the executable name, neither is tracked by this service
    assert!(service.is_unhandled_instance_running());

    service.start(&[]).unwrap();
    // our handle does not match either of them
    assert!(service.is_unhandled_instance_running());

    let own = service.process().pid().unwrap();
    *table.pids.lock() = vec![own];
    assert!(!service.is_unhandled_instance_running());

    assert!(service.stop().await);
}

#[tokio::test]
async fn test_stale_heartbeat_failure_spares_restarted_server() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let requester = ScriptedRequester::new(vec![
        (Duration::from_millis(500), StubRequester::Failing),
        (Duration::from_millis(1500), StubRequester::Pong(Duration::ZERO)),
    ]);
    let (service, _) = server_service(config, Arc::new(requester));
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    // let the first heartbeat issue its ping
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.stop().await);
    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    let pid = service.process().pid();

    // the first heartbeat fails while the second launch is still starting
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(service.state(), RunningState::Starting);
    assert_eq!(service.process().pid(), pid);

    assert_eq!(next_state(&mut states).await, RunningState::Running);
    assert!(service.stop().await);
}

#[tokio::test]
async fn test_stale_heartbeat_success_does_not_promote_restarted_server() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("server"), SERVER_EXECUTABLE, "exec sleep 30");
    let requester = ScriptedRequester::new(vec![
        (Duration::from_millis(500), StubRequester::Pong(Duration::ZERO)),
        (Duration::from_millis(1500), StubRequester::Sentinel),
    ]);
    let (service, _) = server_service(config, Arc::new(requester));
    let mut states = service.subscribe();
    let mut started = service.subscribe_started();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    // let the first heartbeat issue its ping
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.stop().await);
    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(service.state(), RunningState::Starting);
    assert!(started.try_recv().is_err());

    // the second launch is judged by its own heartbeat only
    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);
}

#[tokio::test]
async fn test_stop_kills_server_ignoring_close_request() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(
        &dir.path().join("server"),
        SERVER_EXECUTABLE,
        "trap '' TERM\nexec sleep 30",
    );
    let process = ManagedProcess::new(SERVER_EXECUTABLE, Arc::new(SystemProcessTable))
        .with_stop_timeouts(Duration::from_millis(200), Duration::from_secs(2));
    let service = AkiServerService::with_process(
        config,
        Arc::new(StubRequester::Pong(Duration::ZERO)),
        Arc::new(RecordingNotifier::default()),
        process,
    );
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Starting);
    assert_eq!(next_state(&mut states).await, RunningState::Running);

    let begin = std::time::Instant::now();
    assert!(service.stop().await);
    // the close request was delivered and ignored, so the kill waited for the close timeout
    assert!(begin.elapsed() >= Duration::from_millis(200));

    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);
    assert_eq!(service.state(), RunningState::NotRunning);
    assert_eq!(service.process().pid(), None);
}
