use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::NamedTempFile;

use crate::utils::fs::catch_not_found;

use super::{CacheEntry, CacheError, CacheValue, StorageBackend, Store};

/// File name of the key table written by the in-memory backend.
pub const MEMORY_RESTORE_FILE_NAME: &str = "memory.dat";

/// Keeps values inside the entries themselves.
///
/// With a restore file, the key table (keys and timestamps, no values) is written there on every
/// sweep and flush. Values do not outlive the process, so a restart reads the table only to
/// report what was lost and starts empty.
#[derive(Debug, Default, Clone)]
pub struct InMemory {
    restore_file: Option<PathBuf>,
}

impl InMemory {
    /// A backend that persists nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend writing its key table to `restore_file`.
    pub fn with_restore_file(restore_file: impl Into<PathBuf>) -> Self {
        Self {
            restore_file: Some(restore_file.into()),
        }
    }

    pub fn restore_file(&self) -> Option<&Path> {
        self.restore_file.as_deref()
    }
}

type KeyTable = BTreeMap<String, CacheEntry<()>>;

fn read_key_table(path: &Path) -> Option<KeyTable> {
    let bytes = match catch_not_found(|| fs::read(path)) {
        Ok(bytes) => bytes?,
        Err(error) => {
            let error: &dyn std::error::Error = &error;
            tracing::error!(error, path = %path.display(), "Failed to read memory cache key table");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(table) => Some(table),
        Err(error) => {
            let error: &dyn std::error::Error = &error;
            tracing::warn!(error, path = %path.display(), "Discarding unreadable memory cache key table");
            if let Err(error) = catch_not_found(|| fs::remove_file(path)) {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, "Failed to delete memory cache key table");
            }
            None
        }
    }
}

impl StorageBackend for InMemory {
    type Stored = Arc<dyn Any + Send + Sync>;

    const NAME: &'static str = "memory";

    const ADD_ONLY: bool = false;

    fn restore(&self) -> Vec<CacheEntry<Self::Stored>> {
        let Some(table) = self.restore_file().and_then(read_key_table) else {
            return Vec::new();
        };

        let now = Utc::now();
        let lost = table.values().filter(|entry| !entry.is_expired_at(now)).count();
        if lost > 0 {
            tracing::info!("{} in-memory cache entries did not survive the restart", lost);
        }
        Vec::new()
    }

    fn persist(&self, live: &[CacheEntry<Self::Stored>]) -> io::Result<()> {
        let Some(path) = self.restore_file() else {
            return Ok(());
        };
        let table: KeyTable = live
            .iter()
            .map(|entry| (entry.key().to_owned(), entry.metadata()))
            .collect();

        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = io::BufWriter::new(temp.as_file_mut());
            serde_json::to_writer(&mut writer, &table)?;
            writer.flush()?;
        }
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl<T> Store<T> for InMemory
where
    T: Any + Clone + Send + Sync,
{
    fn store(&self, _key: &str, value: T) -> Result<Self::Stored, CacheError> {
        Ok(Arc::new(value))
    }

    fn load(&self, _key: &str, stored: &Self::Stored) -> Result<CacheValue<T>, CacheError> {
        stored
            .downcast_ref::<T>()
            .cloned()
            .map(CacheValue::Value)
            .ok_or(CacheError::TypeMismatch(type_name::<T>()))
    }
}
