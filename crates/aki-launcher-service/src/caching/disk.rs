use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::utils::fs::{catch_not_found, recreate_dir};

use super::{CacheEntry, CacheError, CacheValue, StorageBackend, Store};

/// Name of the file the disk cache keeps its entry metadata in, relative to the cache directory.
pub const RESTORE_FILE_NAME: &str = "cache.dat";

/// Payload files younger than this are never treated as orphans.
///
/// A payload is written before its entry shows up in the map, so a sweep may see the file
/// without the entry.
const ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Returns the file name the payload for `key` is stored under.
pub fn cache_file_name(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// A value that can be written to and read back from a payload file.
pub trait DiskValue: Sized {
    /// Writes the value into a freshly created, empty file.
    fn write_to(self, file: &mut File) -> Result<(), CacheError>;

    /// Reads the value back from the payload at `path`.
    fn read_from(path: &Path) -> Result<Self, CacheError>;
}

impl DiskValue for Vec<u8> {
    fn write_to(self, file: &mut File) -> Result<(), CacheError> {
        file.write_all(&self)?;
        Ok(())
    }

    fn read_from(path: &Path) -> Result<Self, CacheError> {
        Ok(fs::read(path)?)
    }
}

impl DiskValue for Bytes {
    fn write_to(self, file: &mut File) -> Result<(), CacheError> {
        file.write_all(&self)?;
        Ok(())
    }

    fn read_from(path: &Path) -> Result<Self, CacheError> {
        Ok(fs::read(path)?.into())
    }
}

/// Text is stored as UTF-8.
impl DiskValue for String {
    fn write_to(self, file: &mut File) -> Result<(), CacheError> {
        file.write_all(self.as_bytes())?;
        Ok(())
    }

    fn read_from(path: &Path) -> Result<Self, CacheError> {
        Ok(String::from_utf8(fs::read(path)?)?)
    }
}

/// Streams are copied from their start. Reading yields a new handle opened on the payload.
impl DiskValue for File {
    fn write_to(mut self, file: &mut File) -> Result<(), CacheError> {
        if let Err(error) = self.rewind() {
            let error: &dyn std::error::Error = &error;
            tracing::trace!(error, "Cached stream is not seekable, copying from its position");
        }
        io::copy(&mut self, file)?;
        Ok(())
    }

    fn read_from(path: &Path) -> Result<Self, CacheError> {
        Ok(File::open(path)?)
    }
}

/// Wraps any serde type so that it is cached as JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

impl<T> DiskValue for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn write_to(self, file: &mut File) -> Result<(), CacheError> {
        let mut writer = io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.0)?;
        writer.flush()?;
        Ok(())
    }

    fn read_from(path: &Path) -> Result<Self, CacheError> {
        let bytes = fs::read(path)?;
        Ok(Json(serde_json::from_slice(&bytes)?))
    }
}

/// Keeps every payload in its own file inside a cache directory.
///
/// Payloads are first written into a temporary directory and then moved into place, so a
/// payload file is either complete or absent. Entry metadata goes into [`RESTORE_FILE_NAME`]
/// and is picked up again by the next process.
#[derive(Debug, Clone)]
pub struct OnDisk {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl OnDisk {
    /// Creates the backend, creating `cache_dir` if needed and emptying `tmp_dir`.
    ///
    /// `tmp_dir` must be on the same filesystem as `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        let tmp_dir = tmp_dir.into();
        fs::create_dir_all(&cache_dir)?;
        // Leftovers of writes that never completed.
        recreate_dir(&tmp_dir)?;
        Ok(Self { cache_dir, tmp_dir })
    }

    /// Opens a cache directory that another process may be using at the same time.
    ///
    /// Unlike [`new`](Self::new), the temporary directory is left alone since it may hold the
    /// in-flight writes of that process.
    pub fn open(cache_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let cache_dir = cache_dir.into();
        let tmp_dir = tmp_dir.into();
        fs::create_dir_all(&cache_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self { cache_dir, tmp_dir })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The path of the payload file for `key`.
    pub fn payload_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(cache_file_name(key))
    }

    fn restore_path(&self) -> PathBuf {
        self.cache_dir.join(RESTORE_FILE_NAME)
    }

    /// Creates a new temporary file, recreating the temporary directory if it went missing.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        match NamedTempFile::new_in(&self.tmp_dir) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.tmp_dir)?;
                NamedTempFile::new_in(&self.tmp_dir)
            }
            Err(e) => Err(e),
        }
    }

    fn read_restore_file(&self) -> Option<BTreeMap<String, CacheEntry<PathBuf>>> {
        let path = self.restore_path();
        let bytes = match catch_not_found(|| fs::read(&path)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, path = %path.display(), "Failed to read cache restore file");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(records) => Some(records),
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::warn!(error, path = %path.display(), "Discarding unreadable cache restore file");
                if let Err(error) = catch_not_found(|| fs::remove_file(&path)) {
                    let error: &dyn std::error::Error = &error;
                    tracing::error!(error, "Failed to delete cache restore file");
                }
                None
            }
        }
    }
}

impl StorageBackend for OnDisk {
    type Stored = PathBuf;

    const NAME: &'static str = "disk";

    const ADD_ONLY: bool = true;

    fn release(&self, key: &str, stored: &PathBuf) {
        if let Err(error) = catch_not_found(|| fs::remove_file(stored)) {
            sentry::with_scope(
                |scope| scope.set_extra("path", stored.display().to_string().into()),
                || {
                    let error: &dyn std::error::Error = &error;
                    tracing::error!(error, key, "Failed to delete cache payload");
                },
            );
        }
    }

    fn restore(&self) -> Vec<CacheEntry<PathBuf>> {
        let Some(records) = self.read_restore_file() else {
            return Vec::new();
        };

        let now = Utc::now();
        records
            .into_values()
            .filter_map(|entry| {
                // Only trust paths we would have written ourselves.
                let expected = self.payload_path(entry.key());
                if *entry.value() != expected {
                    tracing::warn!(key = entry.key(), "Dropping cache record with foreign payload path");
                    return None;
                }
                if entry.is_expired_at(now) {
                    self.release(entry.key(), &expected);
                    return None;
                }
                if !expected.is_file() {
                    tracing::debug!(key = entry.key(), "Dropping cache record without payload");
                    return None;
                }
                Some(entry)
            })
            .collect()
    }

    fn persist(&self, live: &[CacheEntry<PathBuf>]) -> io::Result<()> {
        let records: BTreeMap<&str, &CacheEntry<PathBuf>> =
            live.iter().map(|entry| (entry.key(), entry)).collect();

        let mut temp = self.tempfile()?;
        {
            let mut writer = io::BufWriter::new(temp.as_file_mut());
            serde_json::to_writer(&mut writer, &records)?;
            writer.flush()?;
        }
        temp.persist(self.restore_path()).map_err(|e| e.error)?;
        Ok(())
    }

    fn collect_garbage(&self, live: &[CacheEntry<PathBuf>]) {
        let referenced: HashSet<&Path> = live.iter().map(|entry| entry.value().as_path()).collect();
        let cutoff = SystemTime::now()
            .checked_sub(ORPHAN_GRACE_PERIOD)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let read_dir = match fs::read_dir(&self.cache_dir) {
            Ok(read_dir) => read_dir,
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, "Failed to list cache directory");
                return;
            }
        };

        let mut removed = 0;
        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            if dir_entry.file_name() == RESTORE_FILE_NAME || referenced.contains(path.as_path()) {
                continue;
            }
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            if !metadata.is_file() || metadata.modified().map_or(true, |mtime| mtime > cutoff) {
                continue;
            }

            match catch_not_found(|| fs::remove_file(&path)) {
                Ok(_) => removed += 1,
                Err(error) => {
                    let error: &dyn std::error::Error = &error;
                    tracing::warn!(error, path = %path.display(), "Failed to delete orphaned payload");
                }
            }
        }

        if removed > 0 {
            metric!(counter("caches.orphans_removed") += removed as i64, "cache" => Self::NAME);
            tracing::debug!("Removed {} orphaned cache payloads", removed);
        }
    }
}

impl<T: DiskValue> Store<T> for OnDisk {
    fn store(&self, key: &str, value: T) -> Result<PathBuf, CacheError> {
        let mut temp = self.tempfile()?;
        value.write_to(temp.as_file_mut())?;

        let path = self.payload_path(key);
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    fn load(&self, key: &str, stored: &PathBuf) -> Result<CacheValue<T>, CacheError> {
        match T::read_from(stored) {
            Ok(value) => Ok(CacheValue::Value(value)),
            Err(CacheError::Io(error)) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(key, "Cache payload is gone");
                Ok(CacheValue::Null)
            }
            Err(error) => Err(error),
        }
    }
}
