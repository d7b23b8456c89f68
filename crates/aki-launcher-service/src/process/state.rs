use std::fmt;

/// The lifecycle of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunningState {
    /// No process, or it was stopped on request.
    #[default]
    NotRunning,
    /// The process was spawned and its readiness is not confirmed yet.
    Starting,
    /// The process is up and ready.
    Running,
    /// The process exited while running without anyone asking it to.
    StoppedUnexpectedly,
}

impl RunningState {
    /// Returns `true` while a process is spawned and has not been seen exiting.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRunning => "not running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::StoppedUnexpectedly => "stopped unexpectedly",
        };
        f.write_str(name)
    }
}
