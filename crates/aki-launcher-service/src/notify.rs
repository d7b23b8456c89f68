//! User-facing notifications.
//!
//! The process services report outcomes like a cleared cache through a [`Notifier`]. How they
//! reach the user is up to the front end.

use std::fmt;
use std::time::Duration;

/// How important a notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Informational,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Informational => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// A sink for short notifications shown to the user.
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Shows `message` under `title` for `duration`.
    fn notify(&self, title: &str, message: &str, severity: Severity, duration: Duration);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str, severity: Severity, _duration: Duration) {
        match severity {
            Severity::Error => tracing::error!(title, "{}", message),
            Severity::Warning => tracing::warn!(title, "{}", message),
            Severity::Informational | Severity::Success => {
                tracing::info!(title, %severity, "{}", message)
            }
        }
    }
}
