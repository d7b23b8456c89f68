use std::io;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

use super::{CachingProvider, InMemory, OnDisk, MEMORY_RESTORE_FILE_NAME};

/// The two cache providers the rest of the launcher works with.
#[derive(Debug, Clone)]
pub struct CachingService {
    memory: Arc<CachingProvider<InMemory>>,
    disk: Arc<CachingProvider<OnDisk>>,
}

impl CachingService {
    pub fn new(memory: CachingProvider<InMemory>, disk: CachingProvider<OnDisk>) -> Self {
        Self {
            memory: Arc::new(memory),
            disk: Arc::new(disk),
        }
    }

    /// Creates both providers below the configured cache directory.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let backend = OnDisk::new(config.cache_dir("disk"), config.cache_dir("tmp"))?;
        let memory = InMemory::with_restore_file(config.cache_dir(MEMORY_RESTORE_FILE_NAME));
        Ok(Self::new(
            CachingProvider::new(memory, &config.caches),
            CachingProvider::new(backend, &config.caches),
        ))
    }

    pub fn in_memory(&self) -> &Arc<CachingProvider<InMemory>> {
        &self.memory
    }

    pub fn on_disk(&self) -> &Arc<CachingProvider<OnDisk>> {
        &self.disk
    }

    /// Starts the eviction sweep of both providers.
    pub fn start_eviction(&self) -> [JoinHandle<()>; 2] {
        [self.memory.spawn_eviction(), self.disk.spawn_eviction()]
    }

    /// Writes the entries of both providers to their restore files one last time.
    pub fn shutdown(&self) {
        tracing::debug!("Flushing caches");
        self.memory.flush();
        self.disk.flush();
    }

    /// Runs [`shutdown`](Self::shutdown) once `token` is cancelled.
    pub fn spawn_shutdown_hook(&self, token: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Err(error) = tokio::task::spawn_blocking(move || service.shutdown()).await {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, "Failed to flush caches on shutdown");
            }
        })
    }
}
