//! # Launcher Caching infrastructure
//!
//! The launcher caches expensive artifacts it would otherwise download or compute repeatedly:
//! compatibility-layer DLLs, extracted archives, configuration-manager downloads and the like.
//! This module includes all the code dealing with those caches and explains how it works.
//!
//! ## Providers
//!
//! A [`CachingProvider`] owns a concurrent key→[`CacheEntry`] map and delegates the payload to a
//! [`StorageBackend`]. There are two backends:
//!
//! - [`InMemory`] keeps the value itself inside the entry. Any `Clone + Send + Sync` type can be
//!   stored, and reading it back with a different type yields [`CacheValue::NoValue`]. Its
//!   restore file only records keys and timestamps, so values are gone after a restart.
//! - [`OnDisk`] writes the payload to a file named after the SHA-256 hash of the key and keeps
//!   only the path inside the entry. See [`DiskValue`] for the supported payload kinds.
//!
//! The [`CachingService`] composes one provider of each kind behind a single facade.
//!
//! ## Reads
//!
//! Reads return a [`CacheValue`], which distinguishes a real value from an explicit null (the
//! entry exists but its payload file went missing) and from "nothing cached". Expired entries are
//! never returned: they are removed lazily by the read that discovers them, or proactively by the
//! eviction sweep. Decoding failures are logged and turned into [`CacheValue::NoValue`].
//!
//! Only programmer errors, like an empty key, are reported as [`CacheError`] to the caller.
//!
//! ## Expiration
//!
//! Every entry carries an absolute `expiry_date` compared against UTC now. A recurring sweep,
//! started with [`CachingProvider::spawn_eviction`], first fires [`CacheConfig::sweep_delay`]
//! after startup and then every [`CacheConfig::sweep_interval`]. The sweep removes all expired
//! entries, persists the surviving entries to the restore file, and for the disk backend deletes
//! payload files no live entry references.
//!
//! Each removal caused by expiry is announced exactly once on the channel returned by
//! [`CachingProvider::subscribe_evicted`]. Explicit removals are not announced.
//!
//! ## Compute on miss
//!
//! [`CachingProvider::get_or_compute`] and its async siblings run the compute function on a miss
//! and store its result. Concurrent misses on the same key are *not* coalesced: each may run the
//! compute function, and the last store wins.
//!
//! [`CacheConfig::sweep_delay`]: crate::config::CacheConfig::sweep_delay
//! [`CacheConfig::sweep_interval`]: crate::config::CacheConfig::sweep_interval

mod disk;
mod entry;
mod error;
mod memory;
mod provider;
mod service;
mod value;

pub use disk::{cache_file_name, DiskValue, Json, OnDisk, RESTORE_FILE_NAME};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use memory::{InMemory, MEMORY_RESTORE_FILE_NAME};
pub use provider::{CachingProvider, StorageBackend, Store};
pub use service::CachingService;
pub use value::CacheValue;
