//! AKI launcher.
//!
//! Starts and supervises the local game server and the game client, and maintains the caches
//! the launcher keeps between runs.

#![warn(missing_debug_implementations, clippy::all)]

mod cache;
mod cli;
mod launch;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
