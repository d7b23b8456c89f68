use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::SharedConfig;
use crate::notify::{Notifier, Severity};
use crate::utils::fs::recreate_dir;

use super::managed::{launch_command, ManagedProcess, ProcessTable, SystemProcessTable};
use super::{resolve_executable, ProcessError, ProcessService, RunningState};

/// File name of the game client executable inside its install directory.
pub const CLIENT_EXECUTABLE: &str = "EscapeFromTarkov.exe";

/// Supervises the game client.
///
/// The client has no readiness check, it counts as running once spawned.
#[derive(Debug)]
pub struct TarkovClientService {
    process: Arc<ManagedProcess>,
    config: SharedConfig,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
    cache_dir: PathBuf,
}

impl TarkovClientService {
    /// Creates the service.
    ///
    /// `shutdown` is cancelled after a launch when the launcher is configured to close.
    pub fn new(
        config: SharedConfig,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_process_table(config, notifier, shutdown, Arc::new(SystemProcessTable))
    }

    /// Creates the service on top of a custom view of the process table.
    pub fn with_process_table(
        config: SharedConfig,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
        table: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            process: Arc::new(ManagedProcess::new(CLIENT_EXECUTABLE, table)),
            config,
            notifier,
            shutdown,
            cache_dir: default_cache_dir(),
        }
    }

    /// Overrides the directory [`clear_cache`](ProcessService::clear_cache) wipes.
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }
}

/// The client keeps its cache below the system temp directory.
fn default_cache_dir() -> PathBuf {
    std::env::temp_dir()
        .join("Battlestate Games")
        .join("EscapeFromTarkov")
}

impl ProcessService for TarkovClientService {
    fn executable_file_path(&self) -> Option<PathBuf> {
        let config = self.config.get();
        config
            .client
            .install_path
            .as_ref()
            .map(|path| path.join(CLIENT_EXECUTABLE))
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
            resolve_executable(config.client.install_path.as_ref(), "client", CLIENT_EXECUTABLE)?;

        let command = launch_command(&executable, args, &install_path, &config.compat);
        self.process.launch(command, RunningState::Running)?;

        if config.close_after_launch {
            tracing::info!("Client launched, shutting down");
            self.shutdown.cancel();
        }
        Ok(())
    }

    fn stop(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.process.stop())
    }

    fn clear_cache(&self) -> io::Result<()> {
        match recreate_dir(&self.cache_dir) {
            Ok(()) => {
                self.notifier.notify(
                    "Client cache",
                    "The client cache was cleared.",
                    Severity::Success,
                    Duration::from_secs(5),
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, path = %self.cache_dir.display(), "Failed to clear client cache");
                self.notifier.notify(
                    "Client cache",
                    &format!("Clearing the client cache failed: {e}"),
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
