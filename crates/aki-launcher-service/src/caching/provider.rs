use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::CacheConfig;

use super::error::validate_key;
use super::{CacheEntry, CacheError, CacheValue};

/// Capacity of the eviction notification channel.
///
/// Subscribers that fall further behind than this lose the oldest notifications.
const EVICTED_CHANNEL_CAPACITY: usize = 256;

/// The storage half of a [`CachingProvider`].
///
/// The provider owns the key→entry map, expiry and notifications. The backend decides what an
/// entry holds and how payloads are persisted.
pub trait StorageBackend: Send + Sync + 'static {
    /// What an entry holds: the value itself, or a handle to where it lives.
    type Stored: Clone + fmt::Debug + Send + Sync + 'static;

    /// Name used for logs and metric tags.
    const NAME: &'static str;

    /// Whether [`CachingProvider::add`] refuses to overwrite a live entry.
    const ADD_ONLY: bool;

    /// Releases the payload of an entry that left the map.
    fn release(&self, _key: &str, _stored: &Self::Stored) {}

    /// Loads the entries persisted by a previous process, dropping unusable ones.
    fn restore(&self) -> Vec<CacheEntry<Self::Stored>> {
        Vec::new()
    }

    /// Persists the metadata of all live entries.
    fn persist(&self, _live: &[CacheEntry<Self::Stored>]) -> io::Result<()> {
        Ok(())
    }

    /// Deletes stored payloads that no live entry references.
    fn collect_garbage(&self, _live: &[CacheEntry<Self::Stored>]) {}
}

/// Typed access to a [`StorageBackend`].
pub trait Store<T>: StorageBackend {
    /// Stores `value` for `key` and returns what the entry should hold.
    fn store(&self, key: &str, value: T) -> Result<Self::Stored, CacheError>;

    /// Loads the value an entry holds.
    fn load(&self, key: &str, stored: &Self::Stored) -> Result<CacheValue<T>, CacheError>;
}

/// A concurrent key/value cache with per-entry expiry and a pluggable storage backend.
pub struct CachingProvider<B: StorageBackend> {
    backend: B,
    entries: DashMap<String, CacheEntry<B::Stored>>,
    evicted: broadcast::Sender<String>,
    default_expiry: Duration,
    sweep_delay: Duration,
    sweep_interval: Duration,
}

impl<B: StorageBackend> fmt::Debug for CachingProvider<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingProvider")
            .field("backend", &B::NAME)
            .field("entries", &self.entries.len())
            .field("default_expiry", &self.default_expiry)
            .finish()
    }
}

impl<B: StorageBackend> CachingProvider<B> {
    /// Creates a provider and rehydrates whatever entries the backend persisted earlier.
    pub fn new(backend: B, config: &CacheConfig) -> Self {
        let (evicted, _) = broadcast::channel(EVICTED_CHANNEL_CAPACITY);
        let entries = DashMap::new();
        for entry in backend.restore() {
            entries.insert(entry.key().to_owned(), entry);
        }
        if !entries.is_empty() {
            tracing::info!(
                "Restored {} entries into the `{}` cache",
                entries.len(),
                B::NAME
            );
        }

        // A zero period would make the sweep spin.
        let min_period = Duration::from_millis(1);
        Self {
            backend,
            entries,
            evicted,
            default_expiry: config.default_expiry,
            sweep_delay: config.sweep_delay,
            sweep_interval: config.sweep_interval.max(min_period),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn default_expiry(&self) -> Duration {
        self.default_expiry
    }

    /// Subscribes to the keys of entries removed because they expired.
    pub fn subscribe_evicted(&self) -> broadcast::Receiver<String> {
        self.evicted.subscribe()
    }

    /// Adds `value` under `key` with the default expiry.
    ///
    /// Returns `Ok(false)` when the value was not stored: either the backend is add-only and the
    /// key is already live, or writing the payload failed.
    pub fn add<T>(&self, key: &str, value: T) -> Result<bool, CacheError>
    where
        B: Store<T>,
    {
        self.add_with_expiry(key, value, self.default_expiry)
    }

    /// Adds `value` under `key`, expiring `expiry` from now.
    pub fn add_with_expiry<T>(&self, key: &str, value: T, expiry: Duration) -> Result<bool, CacheError>
    where
        B: Store<T>,
    {
        validate_key(key)?;
        Ok(self.put(key, value, expiry, B::ADD_ONLY, |_| ()).is_some())
    }

    /// Reads the value stored under `key`.
    pub fn get<T>(&self, key: &str) -> Result<CacheValue<T>, CacheError>
    where
        B: Store<T>,
    {
        validate_key(key)?;
        metric!(counter("caches.access") += 1, "cache" => B::NAME);

        // Loaded while the shard is locked, so a concurrent removal cannot unlink the payload
        // between the lookup and the read.
        let loaded = match self.entries.get_mut(key) {
            Some(mut guard) if !guard.is_expired() => {
                let entry = guard.value_mut();
                entry.touch();
                self.backend.load(key, entry.value())
            }
            Some(guard) => {
                drop(guard);
                self.evict_if_expired(key);
                metric!(counter("caches.miss") += 1, "cache" => B::NAME);
                return Ok(CacheValue::NoValue);
            }
            None => {
                metric!(counter("caches.miss") += 1, "cache" => B::NAME);
                return Ok(CacheValue::NoValue);
            }
        };

        let value = match loaded {
            Ok(value) => value,
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::warn!(error, key, cache = B::NAME, "Failed to read cached value");
                CacheValue::NoValue
            }
        };
        if value.has_value() {
            metric!(counter("caches.hit") += 1, "cache" => B::NAME);
        }
        Ok(value)
    }

    /// Returns the value stored under `key`, if there is one.
    pub fn try_get<T>(&self, key: &str) -> Option<T>
    where
        B: Store<T>,
    {
        self.get(key).ok()?.into_value()
    }

    /// Returns the cached value, or computes and stores it with the default expiry.
    pub fn get_or_compute<T, F>(&self, key: &str, compute: F) -> Result<CacheValue<T>, CacheError>
    where
        B: Store<T>,
        F: FnOnce(&str) -> T,
    {
        self.get_or_compute_with_expiry(key, compute, self.default_expiry)
    }

    /// Returns the cached value, or computes and stores it.
    ///
    /// Concurrent misses on the same key may each invoke `compute`, the last store wins.
    pub fn get_or_compute_with_expiry<T, F>(
        &self,
        key: &str,
        compute: F,
        expiry: Duration,
    ) -> Result<CacheValue<T>, CacheError>
    where
        B: Store<T>,
        F: FnOnce(&str) -> T,
    {
        let cached = self.get(key)?;
        if cached.has_value() {
            return Ok(cached);
        }

        metric!(counter("caches.computation") += 1, "cache" => B::NAME);
        let value = compute(key);
        Ok(self.store_computed(key, value, expiry))
    }

    /// Async version of [`get_or_compute`](Self::get_or_compute).
    pub async fn get_or_compute_async<T, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<CacheValue<T>, CacheError>
    where
        B: Store<T>,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = T>,
    {
        let cached = self.get(key)?;
        if cached.has_value() {
            return Ok(cached);
        }

        metric!(counter("caches.computation") += 1, "cache" => B::NAME);
        let value = compute(key.to_owned()).await;
        Ok(self.store_computed(key, value, self.default_expiry))
    }

    /// Like [`get_or_compute_async`](Self::get_or_compute_async), for computations that can
    /// fail. Errors are returned to the caller and nothing is cached for them.
    pub async fn try_get_or_compute_async<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
    ) -> Result<CacheValue<T>, E>
    where
        B: Store<T>,
        E: From<CacheError>,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cached = self.get(key)?;
        if cached.has_value() {
            return Ok(cached);
        }

        metric!(counter("caches.computation") += 1, "cache" => B::NAME);
        let value = compute(key.to_owned()).await?;
        Ok(self.store_computed(key, value, self.default_expiry))
    }

    fn store_computed<T>(&self, key: &str, value: T, expiry: Duration) -> CacheValue<T>
    where
        B: Store<T>,
    {
        let loaded = self.put(key, value, expiry, false, |stored| {
            self.backend.load(key, stored)
        });
        match loaded {
            None => CacheValue::NoValue,
            Some(Ok(value)) => value,
            Some(Err(error)) => {
                let error: &dyn std::error::Error = &error;
                tracing::warn!(error, key, cache = B::NAME, "Failed to read computed value");
                CacheValue::NoValue
            }
        }
    }

    /// Returns `true` if `key` holds an unexpired entry.
    pub fn exists(&self, key: &str) -> bool {
        if key.is_empty() || self.evict_if_expired(key) {
            return false;
        }
        self.entries.contains_key(key)
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(occupied) => {
                // Released before the shard is unlocked: payload paths are derived from the key,
                // so a later unlink could hit the payload of a re-added entry.
                self.backend.release(key, occupied.get().value());
                occupied.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Removes all keys starting with `prefix`, ignoring case, and returns how many there were.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| starts_with_ignore_case(entry.key(), prefix))
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter(|key| self.remove(key)).count()
    }

    /// Removes all keys starting with `prefix`, or every key if `prefix` is empty.
    pub fn clear(&self, prefix: &str) -> usize {
        if !prefix.is_empty() {
            return self.remove_by_prefix(prefix);
        }

        let keys: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.iter().filter(|key| self.remove(key)).count()
    }

    /// Counts the unexpired keys starting with `prefix`.
    ///
    /// Unlike [`keys`](Self::keys), the prefix match is case-sensitive.
    pub fn count(&self, prefix: &str) -> usize {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.is_expired_at(now))
            .count()
    }

    /// Lists the unexpired keys starting with `prefix`, ignoring case.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| starts_with_ignore_case(entry.key(), prefix))
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Removes all expired entries, then persists the survivors.
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        // Collect first: removing while iterating would deadlock on the shard locks.
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let evicted = expired
            .iter()
            .filter(|key| self.evict_if_expired(key))
            .count();

        let live = self.live_entries();
        self.backend.collect_garbage(&live);
        self.persist(&live);

        metric!(gauge("caches.size.entries") = live.len() as u64, "cache" => B::NAME);
        tracing::debug!(
            "Swept `{}` cache: evicted {}, retained {}",
            B::NAME,
            evicted,
            live.len()
        );
        evicted
    }

    /// Writes the current entries to the restore file.
    pub fn flush(&self) {
        let live = self.live_entries();
        self.persist(&live);
    }

    /// Spawns the recurring eviction sweep onto the current tokio runtime.
    ///
    /// The task ends once the provider is dropped.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let provider: Weak<Self> = Arc::downgrade(self);
        let start = tokio::time::Instant::now() + self.sweep_delay;
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                // A panicking sweep surfaces as a `JoinError` and must not end the schedule.
                if let Err(error) = tokio::task::spawn_blocking(move || provider.sweep()).await {
                    let error: &dyn std::error::Error = &error;
                    tracing::error!(error, cache = B::NAME, "Cache sweep failed");
                }
            }
        })
    }

    /// Stores `value` and records the entry.
    ///
    /// `on_stored` runs with what the entry holds before the shard is unlocked. Returns `None` if
    /// nothing was stored.
    fn put<T, R>(
        &self,
        key: &str,
        value: T,
        expiry: Duration,
        add_only: bool,
        on_stored: impl FnOnce(&B::Stored) -> R,
    ) -> Option<R>
    where
        B: Store<T>,
    {
        self.evict_if_expired(key);

        // The shard stays locked while the payload is written, so a concurrent sweep cannot
        // release a payload that was just written for this key.
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if add_only {
                    tracing::trace!(key, cache = B::NAME, "Key already cached");
                    return None;
                }
                let stored = self.store_payload(key, value)?;
                // The previous payload lives where the new one was just written, or is owned
                // by the replaced value itself, so there is nothing to release.
                let result = on_stored(&stored);
                occupied.get_mut().replace(stored, expiry);
                Some(result)
            }
            Entry::Vacant(vacant) => {
                let stored = self.store_payload(key, value)?;
                let result = on_stored(&stored);
                vacant.insert(CacheEntry::new(key.to_owned(), stored, expiry));
                Some(result)
            }
        }
    }

    fn store_payload<T>(&self, key: &str, value: T) -> Option<B::Stored>
    where
        B: Store<T>,
    {
        match self.backend.store(key, value) {
            Ok(stored) => Some(stored),
            Err(error) => {
                let error: &dyn std::error::Error = &error;
                tracing::error!(error, key, cache = B::NAME, "Failed to store cache value");
                None
            }
        }
    }

    /// Removes `key` if its entry has expired, announcing the eviction.
    ///
    /// The check, the payload release and the removal happen under the shard lock, so every
    /// expired entry is announced once no matter whether a read or the sweep gets to it first.
    fn evict_if_expired(&self, key: &str) -> bool {
        let now = Utc::now();
        let Entry::Occupied(occupied) = self.entries.entry(key.to_owned()) else {
            return false;
        };
        if !occupied.get().is_expired_at(now) {
            return false;
        }
        self.backend.release(key, occupied.get().value());
        let (key, _) = occupied.remove_entry();

        metric!(counter("caches.evicted") += 1, "cache" => B::NAME);
        tracing::debug!(key, cache = B::NAME, "Evicted expired cache entry");
        // Nobody listening is fine.
        let _ = self.evicted.send(key);
        true
    }

    fn live_entries(&self) -> Vec<CacheEntry<B::Stored>> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn persist(&self, live: &[CacheEntry<B::Stored>]) {
        if let Err(error) = self.backend.persist(live) {
            let error: &dyn std::error::Error = &error;
            tracing::error!(error, cache = B::NAME, "Failed to persist cache entries");
        }
    }
}

fn starts_with_ignore_case(key: &str, prefix: &str) -> bool {
    key.to_lowercase().starts_with(&prefix.to_lowercase())
}
