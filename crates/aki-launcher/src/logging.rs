use std::env;

use aki_launcher_service::config::{Config, LogFormat};
use aki_launcher_service::logging::init_json_logging;
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Crates whose verbosity follows the configured level. Everything else stays at `INFO`.
const LAUNCHER_CRATES: &[&str] = &["aki_launcher", "aki_launcher_service"];

/// Builds the filter directives used when `RUST_LOG` is not set.
fn default_directives(level: LevelFilter) -> String {
    match level {
        LevelFilter::OFF => String::new(),
        LevelFilter::ERROR => "ERROR".to_owned(),
        // The HTTP stack logs every refused connection of the heartbeat.
        LevelFilter::WARN | LevelFilter::INFO => format!("{level},hyper=ERROR,reqwest=ERROR"),
        _ => LAUNCHER_CRATES
            .iter()
            .fold("INFO".to_owned(), |directives, krate| {
                format!("{directives},{krate}={level}")
            }),
    }
}

/// Errors are reported as sentry events, warnings and info lines end up as breadcrumbs.
fn sentry_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        Level::ERROR => EventFilter::Event,
        Level::WARN | Level::INFO => EventFilter::Breadcrumb,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Needs to run before the runtime starts
/// any threads, as it may set `RUST_BACKTRACE`.
pub fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    let directives = env::var("RUST_LOG")
        .unwrap_or_else(|_| default_directives(config.logging.level));

    let pretty = match config.logging.format {
        LogFormat::Json => return init_json_logging(&directives, std::io::stdout),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended(),
    };

    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);
    let fmt = if pretty {
        fmt.pretty().boxed()
    } else {
        fmt.compact().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt.with_filter(EnvFilter::new(directives)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_filter))
        .init();
}

/// Reports a fatal error through tracing, or on `stderr` when no subscriber would record it.
pub fn ensure_log_error(error: &anyhow::Error) {
    let enabled = Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && Level::ERROR <= LevelFilter::current();
    if enabled {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
