use aki_launcher_service::caching::{CachingProvider, OnDisk};
use aki_launcher_service::config::Config;
use anyhow::{Context, Result};

use crate::cli::CacheCommand;

/// Runs a maintenance command against the on-disk cache.
///
/// The in-memory cache only lives as long as a launcher process, so there is nothing to maintain.
pub fn execute(config: Config, command: CacheCommand) -> Result<()> {
    // A running launcher may be writing to the same cache.
    let backend = OnDisk::open(config.cache_dir("disk"), config.cache_dir("tmp"))
        .context("failed to open the disk cache")?;
    let provider = CachingProvider::new(backend, &config.caches);

    match command {
        CacheCommand::List { prefix } => {
            for key in provider.keys(&prefix) {
                println!("{key}");
            }
        }
        CacheCommand::Clear { prefix } => {
            let removed = provider.clear(&prefix);
            provider.flush();
            tracing::info!("Removed {} cache entries", removed);
        }
        CacheCommand::Sweep => {
            let evicted = provider.sweep();
            tracing::info!("Evicted {} expired cache entries", evicted);
        }
    }

    Ok(())
}
