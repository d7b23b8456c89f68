use std::sync::Arc;

use aki_launcher_service::notify::Severity;
use aki_launcher_service::process::{
    ProcessError, ProcessService, RunningState, TarkovClientService, CLIENT_EXECUTABLE,
};
use tokio_util::sync::CancellationToken;

use crate::{dummy_executable, next_state, setup_config, FakeTable, RecordingNotifier};

fn client_service(
    config: aki_launcher_service::config::SharedConfig,
) -> (TarkovClientService, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let service = TarkovClientService::new(config, notifier.clone(), CancellationToken::new());
    (service, notifier)
}

#[tokio::test]
async fn test_client_crash_is_unexpected() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exec sleep 30");
    let (service, _) = client_service(config);
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Running);

    let pid = service.process().pid().unwrap();
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    assert_eq!(
        next_state(&mut states).await,
        RunningState::StoppedUnexpectedly
    );
    assert_eq!(service.state(), RunningState::StoppedUnexpectedly);
    assert_eq!(service.process().pid(), None);
}

#[tokio::test]
async fn test_client_stop_is_expected() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exec sleep 30");
    let (service, _) = client_service(config);
    let mut states = service.subscribe();

    service.start(&[]).unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Running);

    assert!(service.stop().await);
    assert_eq!(next_state(&mut states).await, RunningState::NotRunning);
    assert_eq!(service.state(), RunningState::NotRunning);

    // nothing left to stop
    assert!(!service.stop().await);

    // the stop request does not leak into the next run
    service.start(&[]).unwrap();
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
async fn test_client_normal_exit_while_running() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exit 0");
    let (service, _) = client_service(config);
    let mut states = service.subscribe();

    service.start(&[]).unwrap();

    assert_eq!(next_state(&mut states).await, RunningState::Running);
    // the client was not asked to stop
    assert_eq!(
        next_state(&mut states).await,
        RunningState::StoppedUnexpectedly
    );
}

#[tokio::test]
async fn test_client_arguments() {
    let (config, dir) = setup_config(|_| {});
    let marker = dir.path().join("arguments");
    let body = format!("echo \"$@\" > '{}'", marker.display());
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, &body);
    let (service, _) = client_service(config);
    let mut states = service.subscribe();

    service
        .start(&["-token=pmc".to_owned(), "-config={}".to_owned()])
        .unwrap();
    assert_eq!(next_state(&mut states).await, RunningState::Running);
    next_state(&mut states).await;

    let arguments = std::fs::read_to_string(marker).unwrap();
    assert_eq!(arguments.trim(), "-token=pmc -config={}");
}

#[tokio::test]
async fn test_client_already_running() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exec sleep 30");
    let (service, _) = client_service(config);

    service.start(&[]).unwrap();
    assert!(matches!(
        service.start(&[]),
        Err(ProcessError::AlreadyRunning)
    ));

    assert!(service.stop().await);
}

#[tokio::test]
async fn test_client_not_installed() {
    let (config, dir) = setup_config(|_| {});
    let (service, _) = client_service(config.clone());

    assert_eq!(
        service.executable_file_path(),
        Some(dir.path().join("client").join(CLIENT_EXECUTABLE))
    );
    assert!(matches!(
        service.start(&[]),
        Err(ProcessError::MissingExecutable(_))
    ));

    config.update(|config| config.client.install_path = None);
    assert_eq!(service.executable_file_path(), None);
    assert!(matches!(
        service.start(&[]),
        Err(ProcessError::NotConfigured(_))
    ));
    assert_eq!(service.state(), RunningState::NotRunning);
}

#[tokio::test]
async fn test_close_after_launch() {
    let (config, dir) = setup_config(|config| config.close_after_launch = true);
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exec sleep 30");
    let shutdown = CancellationToken::new();
    let service = TarkovClientService::new(
        config,
        Arc::new(RecordingNotifier::default()),
        shutdown.clone(),
    );

    service.start(&[]).unwrap();

    assert!(shutdown.is_cancelled());
    assert!(service.stop().await);
}

#[tokio::test]
async fn test_clear_client_cache() {
    let (config, dir) = setup_config(|_| {});
    let cache_dir = dir.path().join("eft-cache");
    std::fs::create_dir_all(cache_dir.join("shaders")).unwrap();
    std::fs::write(cache_dir.join("shaders/cache.bin"), b"spam").unwrap();
    let (service, notifier) = client_service(config);
    let service = service.with_cache_dir(&cache_dir);

    service.clear_cache().unwrap();

    assert!(cache_dir.is_dir());
    assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 0);
    assert_eq!(
        *notifier.notifications.lock(),
        vec![("Client cache".to_owned(), Severity::Success)]
    );
}

#[tokio::test]
async fn test_unhandled_client_instance() {
    let (config, dir) = setup_config(|_| {});
    dummy_executable(&dir.path().join("client"), CLIENT_EXECUTABLE, "exec sleep 30");
    let table = Arc::new(FakeTable::default());
    let service = TarkovClientService::with_process_table(
        config,
        Arc::new(RecordingNotifier::default()),
        CancellationToken::new(),
        table.clone(),
    );

    assert!(!service.is_unhandled_instance_running());

    // two instances, none of them ours
    *table.pids.lock() = vec![1_000_001, 1_000_002];
    assert!(service.is_unhandled_instance_running());

    service.start(&[]).unwrap();
    let own = service.process().pid().unwrap();

    *table.pids.lock() = vec![own];
    assert!(!service.is_unhandled_instance_running());

    *table.pids.lock() = vec![own, 1_000_001];
    assert!(service.is_unhandled_instance_running());

    assert!(service.stop().await);

    // once our process is gone, whatever remains is not ours
    *table.pids.lock() = vec![own];
    assert!(service.is_unhandled_instance_running());
}
