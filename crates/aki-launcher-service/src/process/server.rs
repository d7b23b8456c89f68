use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::broadcast;

use crate::config::SharedConfig;
use crate::notify::{Notifier, Severity};
use crate::requests::ServerRequester;
use crate::utils::fs::recreate_dir;

use super::managed::{launch_command, ManagedProcess, ProcessTable, RunId, SystemProcessTable};
use super::{resolve_executable, ProcessError, ProcessService, RunningState};

/// File name of the server executable inside its install directory.
pub const SERVER_EXECUTABLE: &str = "Aki.Server.exe";

/// How many output lines are kept for late subscribers.
pub const OUTPUT_BUFFER_LINES: usize = 500;

const HTTP_CONFIG_PATH: &str = "Aki_Data/Server/configs/http.json";
const CACHE_DIR: &str = "user/cache";
const DEFAULT_PORT: u16 = 6969;

/// Sent once the heartbeat confirmed that the server accepts requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStarted {
    /// The address the server was pinged at.
    pub address: SocketAddr,
    /// Round-trip time of the heartbeat ping.
    pub ping: Duration,
}

/// The bind address section of the server's HTTP configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct HttpConfig {
    ip: String,
    port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Output lines of the server.
///
/// Lines go straight to live subscribers. While nobody listens, the most recent
/// [`OUTPUT_BUFFER_LINES`] are retained instead.
#[derive(Debug)]
struct OutputBuffer {
    lines: Mutex<VecDeque<String>>,
    live: broadcast::Sender<String>,
}

impl OutputBuffer {
    fn new() -> Self {
        let (live, _) = broadcast::channel(OUTPUT_BUFFER_LINES);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(OUTPUT_BUFFER_LINES)),
            live,
        }
    }

    fn push(&self, line: String) {
        if self.live.receiver_count() > 0 && self.live.send(line.clone()).is_ok() {
            return;
        }
        let mut lines = self.lines.lock();
        if lines.len() == OUTPUT_BUFFER_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn cached(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    async fn pump(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.push(line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read server output");
                    break;
                }
            }
        }
    }
}

/// Supervises the local game server.
#[derive(Debug)]
pub struct AkiServerService {
    process: Arc<ManagedProcess>,
    config: SharedConfig,
    requester: Arc<dyn ServerRequester>,
    notifier: Arc<dyn Notifier>,
    output: Arc<OutputBuffer>,
    started: broadcast::Sender<ServerStarted>,
    address: Arc<Mutex<Option<SocketAddr>>>,
}

impl AkiServerService {
    pub fn new(
        config: SharedConfig,
        requester: Arc<dyn ServerRequester>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::with_process_table(config, requester, notifier, Arc::new(SystemProcessTable))
    }

    /// Creates the service on top of a custom view of the process table.
    pub fn with_process_table(
        config: SharedConfig,
        requester: Arc<dyn ServerRequester>,
        notifier: Arc<dyn Notifier>,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self::with_process(
            config,
            requester,
            notifier,
            ManagedProcess::new(SERVER_EXECUTABLE, table),
        )
    }

    /// Creates the service around a preconfigured [`ManagedProcess`].
    pub fn with_process(
        config: SharedConfig,
        requester: Arc<dyn ServerRequester>,
        notifier: Arc<dyn Notifier>,
        process: ManagedProcess,
    ) -> Self {
        let (started, _) = broadcast::channel(4);
        Self {
            process: Arc::new(process),
            config,
            requester,
            notifier,
            output: Arc::new(OutputBuffer::new()),
            started,
            address: Arc::new(Mutex::new(None)),
        }
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    /// The address the most recent heartbeat pinged.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.lock()
    }

    /// The output lines retained while nobody was subscribed.
    pub fn cached_output(&self) -> Vec<String> {
        self.output.cached()
    }

    /// Subscribes to the server output from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<String> {
        self.output.live.subscribe()
    }

    /// Subscribes to confirmations that the server accepts requests.
    pub fn subscribe_started(&self) -> broadcast::Receiver<ServerStarted> {
        self.started.subscribe()
    }
}

impl ProcessService for AkiServerService {
    fn executable_file_path(&self) -> Option<PathBuf> {
        let config = self.config.get();
        config
            .server
            .install_path
            .as_ref()
            .map(|path| path.join(SERVER_EXECUTABLE))
    }

    fn state(&self) -> RunningState {
        self.process.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<RunningState> {
        self.process.subscribe()
    }

    fn start(&self, args: &[String]) -> Result<(), ProcessError> {
        let config = self.config.get();
        let (install_path, executable) =
            resolve_executable(config.server.install_path.as_ref(), "server", SERVER_EXECUTABLE)?;

        let capture_output = !config.close_after_launch;
        let mut command = launch_command(&executable, args, &install_path, &config.compat);
        if capture_output {
            command.stdout(Stdio::piped());
        }

        let launched = self.process.launch(command, RunningState::Starting)?;
        if let Some(stdout) = launched.stdout {
            tokio::spawn(Arc::clone(&self.output).pump(stdout));
        }

        tokio::spawn(heartbeat(Heartbeat {
            process: Arc::clone(&self.process),
            run: launched.run,
            requester: Arc::clone(&self.requester),
            install_path,
            address: Arc::clone(&self.address),
            started: self.started.clone(),
        }));
        Ok(())
    }

    fn stop(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.process.stop())
    }

    fn clear_cache(&self) -> io::Result<()> {
        let config = self.config.get();
        let Some(install_path) = config.server.install_path.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                ProcessError::NotConfigured("server"),
            ));
        };

        let cache_dir = install_path.join(CACHE_DIR);
        match recreate_dir(&cache_dir) {
            Ok(()) => {
                self.notifier.notify(
                    "Server cache",
                    "The server cache was cleared.",
                    Severity::Success,
                    Duration::from_secs(5),
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, path = %cache_dir.display(), "Failed to clear server cache");
                self.notifier.notify(
                    "Server cache",
                    &format!("Clearing the server cache failed: {e}"),
                    Severity::Error,
                    Duration::from_secs(10),
                );
                Err(e)
            }
        }
    }

    fn is_unhandled_instance_running(&self) -> bool {
        self.process.is_unhandled_instance_running()
    }
}

/// Everything the heartbeat of one launch needs.
struct Heartbeat {
    process: Arc<ManagedProcess>,
    run: RunId,
    requester: Arc<dyn ServerRequester>,
    install_path: PathBuf,
    address: Arc<Mutex<Option<SocketAddr>>>,
    started: broadcast::Sender<ServerStarted>,
}

/// Confirms that a freshly spawned server accepts requests, or kills it.
///
/// Exactly one ping is issued: any failure is fatal to the launch. The heartbeat only acts on
/// the launch it was spawned for, a restarted server gets its own. [`ServerStarted`] is only
/// sent if the server is still alive when the ping succeeds. A server that exited in the
/// meantime stays `NotRunning` and is not announced.
async fn heartbeat(heartbeat: Heartbeat) {
    let Heartbeat {
        process,
        run,
        requester,
        install_path,
        address,
        started,
    } = heartbeat;

    let target = server_address(&install_path).await;
    *address.lock() = Some(target);

    match requester.ping(target).await {
        Ok(Some(ping)) => {
            if process.mark_running(run) {
                tracing::info!("Server is ready at {} (ping {:?})", target, ping);
                // Nobody listening is fine.
                let _ = started.send(ServerStarted {
                    address: target,
                    ping,
                });
            } else {
                tracing::warn!("Server answered at {} but its launch has ended", target);
            }
        }
        Ok(None) => {
            tracing::error!("Server at {} did not answer the heartbeat, killing it", target);
            process.kill_run(run);
        }
        Err(e) => {
            let error: &dyn std::error::Error = &e;
            tracing::error!(error, "Heartbeat to server at {} failed, killing it", target);
            process.kill_run(run);
        }
    }
}

/// Reads the address to ping from the server's HTTP configuration.
///
/// Falls back to `127.0.0.1:6969` for missing values, and pings the loopback address when the
/// server binds to all interfaces.
async fn server_address(install_path: &Path) -> SocketAddr {
    let path = install_path.join(HTTP_CONFIG_PATH);
    let http_config = match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice::<HttpConfig>(&bytes).unwrap_or_else(|e| {
            tracing::warn!(error = %e, path = %path.display(), "Invalid server HTTP config");
            HttpConfig::default()
        }),
        Err(e) => {
            tracing::debug!(error = %e, path = %path.display(), "No server HTTP config");
            HttpConfig::default()
        }
    };

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let port = http_config.port;
    let ip = match http_config.ip.trim() {
        "" => loopback,
        host => match host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match tokio::net::lookup_host((host, port)).await {
                Ok(mut addrs) => addrs.next().map_or(loopback, |addr| addr.ip()),
                Err(e) => {
                    tracing::warn!(error = %e, host, "Cannot resolve server host");
                    loopback
                }
            },
        },
    };

    if ip.is_unspecified() {
        SocketAddr::new(loopback, port)
    } else {
        SocketAddr::new(ip, port)
    }
}
