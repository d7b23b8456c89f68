use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use aki_launcher_service::config::{Config, SharedConfig};
use aki_launcher_service::notify::{Notifier, Severity};
use aki_launcher_service::process::{ProcessTable, RunningState};
use aki_launcher_service::requests::{RequestError, ServerRequester};
use aki_launcher_test as test;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub use test::{dummy_executable, ping_server, PingResponse, Server};

/// Creates a configuration with client and server installed below a temporary directory.
///
/// Keep the returned [`TempDir`](test::TempDir) until the test has finished.
pub fn setup_config(update_config: impl FnOnce(&mut Config)) -> (SharedConfig, test::TempDir) {
    test::setup();

    let dir = test::tempdir();
    let client_dir = dir.path().join("client");
    let server_dir = dir.path().join("server");
    std::fs::create_dir_all(&client_dir).unwrap();
    std::fs::create_dir_all(&server_dir).unwrap();

    let mut config = Config {
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };
    config.client.install_path = Some(client_dir);
    config.server.install_path = Some(server_dir);
    update_config(&mut config);

    (SharedConfig::new(config), dir)
}

/// Writes the HTTP configuration the server reads its ping address from.
pub fn write_http_config(server_dir: &Path, address: SocketAddr) {
    let path = server_dir.join("Aki_Data/Server/configs/http.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let config = format!(
        r#"{{"ip": "{}", "port": {}, "logRequests": true}}"#,
        address.ip(),
        address.port()
    );
    std::fs::write(path, config).unwrap();
}

/// Waits for the next state transition.
pub async fn next_state(states: &mut broadcast::Receiver<RunningState>) -> RunningState {
    tokio::time::timeout(Duration::from_secs(20), states.recv())
        .await
        .expect("timed out waiting for a state transition")
        .expect("state channel closed")
}

/// Collects transitions up to and including the first one that ends a run.
pub async fn states_until_exit(states: &mut broadcast::Receiver<RunningState>) -> Vec<RunningState> {
    let mut seen = Vec::new();
    loop {
        let state = next_state(states).await;
        seen.push(state);
        if !state.is_active() {
            return seen;
        }
    }
}

/// A requester answering every ping the same way.
#[derive(Debug, Clone, Copy)]
pub enum StubRequester {
    /// The ping succeeds after the given delay.
    Pong(Duration),
    /// The server answers, but not with a pong.
    Sentinel,
    /// The ping cannot be delivered.
    Failing,
}

impl ServerRequester for StubRequester {
    fn ping(&self, _address: SocketAddr) -> BoxFuture<'_, Result<Option<Duration>, RequestError>> {
        let stub = *self;
        Box::pin(async move {
            match stub {
                StubRequester::Pong(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Some(Duration::from_millis(3)))
                }
                StubRequester::Sentinel => Ok(None),
                StubRequester::Failing => Err(RequestError::InvalidAddress(
                    url::ParseError::EmptyHost,
                )),
            }
        })
    }
}

/// A requester answering consecutive pings from a script.
///
/// Each answer is given after its delay. Once the script is used up, pings fail.
#[derive(Debug)]
pub struct ScriptedRequester {
    answers: Mutex<VecDeque<(Duration, StubRequester)>>,
}

impl ScriptedRequester {
    pub fn new(answers: Vec<(Duration, StubRequester)>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }
}

impl ServerRequester for ScriptedRequester {
    fn ping(&self, address: SocketAddr) -> BoxFuture<'_, Result<Option<Duration>, RequestError>> {
        let (delay, answer) = self
            .answers
            .lock()
            .pop_front()
            .unwrap_or((Duration::ZERO, StubRequester::Failing));
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            answer.ping(address).await
        })
    }
}

/// A notifier remembering everything it was told.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(String, Severity)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, _message: &str, severity: Severity, _duration: Duration) {
        self.notifications.lock().push((title.to_owned(), severity));
    }
}

/// A process table listing whatever the test puts into it.
#[derive(Debug, Default)]
pub struct FakeTable {
    pub pids: Mutex<Vec<u32>>,
}

impl FakeTable {
    pub fn with_pids(pids: Vec<u32>) -> Self {
        Self {
            pids: Mutex::new(pids),
        }
    }
}

impl ProcessTable for FakeTable {
    fn pids_by_name(&self, _name: &str) -> Vec<u32> {
        self.pids.lock().clone()
    }

    fn request_close(&self, _pid: u32) -> bool {
        false
    }
}
