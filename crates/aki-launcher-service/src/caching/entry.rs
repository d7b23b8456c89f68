use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A single cached value together with its expiry and access timestamps.
///
/// `V` is whatever the backend keeps in memory: the value itself for the in-memory backend,
/// the payload path for the disk backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    key: String,
    value: V,
    expiry_date: DateTime<Utc>,
    last_access: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    pub(super) fn new(key: String, value: V, expiry: Duration) -> Self {
        let now = Utc::now();
        Self {
            key,
            value,
            expiry_date: expiry_from(now, expiry),
            last_access: now,
            last_modified: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn expiry_date(&self) -> DateTime<Utc> {
        self.expiry_date
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        self.last_access
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry_date
    }

    /// The timestamps of this entry without its value.
    pub(super) fn metadata(&self) -> CacheEntry<()> {
        CacheEntry {
            key: self.key.clone(),
            value: (),
            expiry_date: self.expiry_date,
            last_access: self.last_access,
            last_modified: self.last_modified,
        }
    }

    /// Records a successful read.
    pub(super) fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Replaces the value and restarts the expiry, returning the previous value.
    pub(super) fn replace(&mut self, value: V, expiry: Duration) -> V {
        let now = Utc::now();
        self.expiry_date = expiry_from(now, expiry);
        self.last_access = now;
        self.last_modified = now;
        std::mem::replace(&mut self.value, value)
    }
}

fn expiry_from(now: DateTime<Utc>, expiry: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(expiry)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
