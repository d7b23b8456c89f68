//! Supervision of the game server and game client processes.
//!
//! Both services wrap a [`ManagedProcess`], which owns the OS process and its [`RunningState`].
//! The state moves `NotRunning → Starting → Running` while launching and ends in `NotRunning`
//! when the process was stopped on request, or in `StoppedUnexpectedly` when a running process
//! went away on its own. Transitions are announced on the channel returned by
//! [`ProcessService::subscribe`].
//!
//! The client is considered running as soon as it is spawned. The server stays `Starting` until
//! a single heartbeat ping confirms that it accepts requests, and is killed if that ping fails.

use std::io;
use std::path::PathBuf;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

mod client;
mod managed;
mod server;
mod state;

pub use client::{TarkovClientService, CLIENT_EXECUTABLE};
pub use managed::{
    launch_command, Launched, ManagedProcess, ProcessTable, RunId, SystemProcessTable,
    STOP_TIMEOUT,
};
pub use server::{AkiServerService, ServerStarted, OUTPUT_BUFFER_LINES, SERVER_EXECUTABLE};
pub use state::RunningState;

/// An error that prevents a process from being started.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The install path of the component is not configured.
    #[error("the {0} install path is not configured")]
    NotConfigured(&'static str),
    /// The executable does not exist.
    #[error("executable not found at {}", .0.display())]
    MissingExecutable(PathBuf),
    /// The previous process has not exited yet.
    #[error("the process is already running")]
    AlreadyRunning,
    /// The OS refused to spawn the process.
    #[error("failed to spawn the process")]
    Spawn(#[source] io::Error),
}

/// A supervised game process.
pub trait ProcessService: Send + Sync {
    /// The configured location of the executable, if there is one.
    fn executable_file_path(&self) -> Option<PathBuf>;

    fn state(&self) -> RunningState;

    /// Subscribes to state transitions.
    fn subscribe(&self) -> broadcast::Receiver<RunningState>;

    /// Spawns the process with `args`.
    ///
    /// Returns once the process is spawned, readiness is reported through [`state`](Self::state)
    /// and [`subscribe`](Self::subscribe). Must be called from within a tokio runtime.
    fn start(&self, args: &[String]) -> Result<(), ProcessError>;

    /// Stops the process, see [`ManagedProcess::stop`].
    fn stop(&self) -> BoxFuture<'_, bool>;

    /// Deletes and recreates the component's cache directory.
    fn clear_cache(&self) -> io::Result<()>;

    /// Returns `true` if an instance runs that this service did not start.
    fn is_unhandled_instance_running(&self) -> bool;
}

/// Resolves `executable` inside the configured install directory and checks it exists.
fn resolve_executable(
    install_path: Option<&PathBuf>,
    component: &'static str,
    executable: &str,
) -> Result<(PathBuf, PathBuf), ProcessError> {
    let install_path = install_path.ok_or(ProcessError::NotConfigured(component))?;
    let executable = install_path.join(executable);
    if !executable.is_file() {
        return Err(ProcessError::MissingExecutable(executable));
    }
    Ok((install_path.clone(), executable))
}
