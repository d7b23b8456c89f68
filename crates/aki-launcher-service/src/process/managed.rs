use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, Signal, System};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::CompatConfig;

use super::{ProcessError, RunningState};

/// How long [`ManagedProcess::stop`] waits after asking the process to close, and again after
/// killing it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_CHANNEL_CAPACITY: usize = 16;

/// A view on the processes running on this machine.
pub trait ProcessTable: Send + Sync + fmt::Debug {
    /// Lists the IDs of all processes with the executable name `name`.
    fn pids_by_name(&self, name: &str) -> Vec<u32>;

    /// Asks the process `pid` to shut down, returning whether the request was delivered.
    fn request_close(&self, pid: u32) -> bool;
}

/// The process table of the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn pids_by_name(&self, name: &str) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes();
        system
            .processes()
            .values()
            .filter(|process| {
                process.name() == name
                    || process
                        .exe()
                        .and_then(Path::file_name)
                        .is_some_and(|exe| exe == name)
            })
            .map(|process| process.pid().as_u32())
            .collect()
    }

    fn request_close(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return false;
        }
        system
            .process(pid)
            .and_then(|process| process.kill_with(Signal::Term))
            .unwrap_or(false)
    }
}

/// Identifies a single launch of a [`ManagedProcess`].
///
/// Tasks spawned for a launch hold on to its id, so they cannot act on a later launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(u64);

/// A freshly spawned process.
#[derive(Debug)]
pub struct Launched {
    pub run: RunId,
    /// The standard output, if the command piped it.
    pub stdout: Option<ChildStdout>,
}

/// The OS process of the current run.
#[derive(Debug)]
struct ProcessHandle {
    run: RunId,
    pid: Option<u32>,
    kill: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

/// Supervises at most one OS process and tracks its [`RunningState`].
///
/// Exits are classified by the exit watcher: a process that exits while [`Running`] without a
/// preceding stop request ends up [`StoppedUnexpectedly`], every other exit in [`NotRunning`].
///
/// [`Running`]: RunningState::Running
/// [`StoppedUnexpectedly`]: RunningState::StoppedUnexpectedly
/// [`NotRunning`]: RunningState::NotRunning
pub struct ManagedProcess {
    name: &'static str,
    table: Arc<dyn ProcessTable>,
    state: Mutex<RunningState>,
    stop_requested: AtomicBool,
    next_run: AtomicU64,
    handle: Mutex<Option<ProcessHandle>>,
    state_changed: broadcast::Sender<RunningState>,
    close_timeout: Duration,
    kill_timeout: Duration,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("pid", &self.pid())
            .finish()
    }
}

impl ManagedProcess {
    /// Creates a supervisor for processes with the executable name `name`.
    pub fn new(name: &'static str, table: Arc<dyn ProcessTable>) -> Self {
        let (state_changed, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            name,
            table,
            state: Mutex::new(RunningState::NotRunning),
            stop_requested: AtomicBool::new(false),
            next_run: AtomicU64::new(0),
            handle: Mutex::new(None),
            state_changed,
            close_timeout: STOP_TIMEOUT,
            kill_timeout: STOP_TIMEOUT,
        }
    }

    /// Overrides the two waits of [`stop`](Self::stop).
    pub fn with_stop_timeouts(mut self, close_timeout: Duration, kill_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self.kill_timeout = kill_timeout;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> RunningState {
        *self.state.lock()
    }

    /// Subscribes to state transitions. Every transition is delivered once.
    pub fn subscribe(&self) -> broadcast::Receiver<RunningState> {
        self.state_changed.subscribe()
    }

    /// The ID of the current process, if it is still alive.
    pub fn pid(&self) -> Option<u32> {
        self.handle
            .lock()
            .as_ref()
            .filter(|handle| !handle.has_exited())
            .and_then(|handle| handle.pid)
    }

    /// Spawns `command` and moves to `state`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(
        self: &Arc<Self>,
        mut command: Command,
        state: RunningState,
    ) -> Result<Launched, ProcessError> {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|handle| !handle.has_exited()) {
            return Err(ProcessError::AlreadyRunning);
        }

        // A leftover request must not classify the exit of this new process.
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut child = command.kill_on_drop(false).spawn().map_err(ProcessError::Spawn)?;
        let stdout = child.stdout.take();
        let pid = child.id();
        let run = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        *handle = Some(ProcessHandle {
            run,
            pid,
            kill: kill.clone(),
            exited: exited_rx,
        });
        drop(handle);

        tracing::info!(process = self.name, pid, "Process started");
        metric!(counter("process.start") += 1, "process" => self.name);
        self.update_state(state);

        tokio::spawn(Arc::clone(self).watch_exit(child, kill, exited_tx));
        Ok(Launched { run, stdout })
    }

    /// Moves the process of launch `run` to [`RunningState::Running`].
    ///
    /// Returns `false` and leaves the state alone if that process exited in the meantime or a
    /// newer launch replaced it.
    pub fn mark_running(&self, run: RunId) -> bool {
        let exited = self
            .handle
            .lock()
            .as_ref()
            .filter(|handle| handle.run == run)
            .map(|handle| handle.exited.clone());
        let mut state = self.state.lock();
        let alive = exited.is_some_and(|exited| !*exited.borrow());
        if alive {
            self.transition(&mut state, RunningState::Running);
        }
        alive
    }

    /// Stops the process: asks it to close, then kills it if it does not.
    ///
    /// Returns `true` once the process has exited, `false` if there was nothing to stop or the
    /// process survived both attempts.
    pub async fn stop(&self) -> bool {
        let Some((pid, kill, mut exited)) = self.live_handle() else {
            tracing::debug!(process = self.name, "Nothing to stop");
            return false;
        };
        if self.state() == RunningState::NotRunning {
            return false;
        }

        // Set before anything else so the exit watcher classifies the exit as requested.
        self.stop_requested.store(true, Ordering::SeqCst);

        let close_requested = pid.is_some_and(|pid| self.table.request_close(pid));
        if close_requested && wait_for_exit(&mut exited, self.close_timeout).await {
            return true;
        }

        tracing::warn!(process = self.name, pid, "Process did not close in time, killing it");
        kill.cancel();
        if wait_for_exit(&mut exited, self.kill_timeout).await {
            return true;
        }

        tracing::error!(process = self.name, pid, "Failed to kill process");
        false
    }

    /// Kills the process without asking it to close first.
    pub fn kill(&self) {
        if let Some((pid, kill, _)) = self.live_handle() {
            tracing::info!(process = self.name, pid, "Killing process");
            self.stop_requested.store(true, Ordering::SeqCst);
            kill.cancel();
        }
    }

    /// Kills the process of launch `run`, unless a newer launch replaced it.
    ///
    /// Returns `false` if there was nothing to kill.
    pub fn kill_run(&self, run: RunId) -> bool {
        let handle = self.handle.lock();
        let Some(handle) = handle
            .as_ref()
            .filter(|handle| handle.run == run && !handle.has_exited())
        else {
            tracing::debug!(process = self.name, "Launch already ended, nothing to kill");
            return false;
        };
        tracing::info!(process = self.name, pid = handle.pid, "Killing process");
        self.stop_requested.store(true, Ordering::SeqCst);
        handle.kill.cancel();
        true
    }

    /// Returns `true` if a process with our executable name runs that we did not start.
    pub fn is_unhandled_instance_running(&self) -> bool {
        let pids = self.table.pids_by_name(self.name);
        if pids.is_empty() {
            return false;
        }
        match self.pid() {
            Some(own) => pids.iter().any(|pid| *pid != own),
            None => true,
        }
    }

    fn live_handle(&self) -> Option<(Option<u32>, CancellationToken, watch::Receiver<bool>)> {
        let handle = self.handle.lock();
        let handle = handle.as_ref().filter(|handle| !handle.has_exited())?;
        Some((handle.pid, handle.kill.clone(), handle.exited.clone()))
    }

    fn update_state(&self, next: RunningState) {
        let mut state = self.state.lock();
        self.transition(&mut state, next);
    }

    fn transition(&self, state: &mut RunningState, next: RunningState) {
        if *state == next {
            return;
        }
        tracing::info!(process = self.name, "Process state changed: {} -> {}", state, next);
        *state = next;
        // Nobody listening is fine.
        let _ = self.state_changed.send(next);
    }

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        kill: CancellationToken,
        exited: watch::Sender<bool>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, process = self.name, "Failed to kill process");
                }
                child.wait().await
            }
        };
        self.on_exit(status.ok(), &exited);
    }

    fn on_exit(&self, status: Option<ExitStatus>, exited: &watch::Sender<bool>) {
        let mut state = self.state.lock();
        // Published under the state lock, so `mark_running` cannot revive an exited process.
        exited.send_replace(true);

        let requested = self.stop_requested.swap(false, Ordering::SeqCst);
        let next = if *state == RunningState::Running && !requested {
            RunningState::StoppedUnexpectedly
        } else {
            RunningState::NotRunning
        };

        match status {
            Some(status) => tracing::info!(process = self.name, %status, requested, "Process exited"),
            None => tracing::warn!(process = self.name, requested, "Process exited, status unknown"),
        }
        metric!(
            counter("process.exit") += 1,
            "process" => self.name,
            "expected" => if next == RunningState::NotRunning { "true" } else { "false" },
        );
        self.transition(&mut state, next);
    }
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exited.wait_for(|exited| *exited)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Builds the command that runs `executable` from `working_dir`.
///
/// On hosts other than Windows a configured compatibility runner wraps the executable:
/// `runner [compat args] executable [args]`, with the runner prefix exported as `WINEPREFIX`.
pub fn launch_command(
    executable: &Path,
    args: &[String],
    working_dir: &Path,
    compat: &CompatConfig,
) -> Command {
    let runner = compat.runner.as_ref().filter(|_| !cfg!(windows));
    let mut command = match runner {
        Some(runner) => {
            let mut command = Command::new(runner);
            command.args(&compat.args).arg(executable);
            if let Some(prefix) = &compat.prefix {
                command.env("WINEPREFIX", prefix);
            }
            command.envs(&compat.env);
            command
        }
        None => Command::new(executable),
    };
    command
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null());
    command
}
