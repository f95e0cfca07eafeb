//! Process-local cache backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use warrant_core::WarrantResult;

use super::key::SubjectActionKey;
use super::traits::{CacheBackend, CacheEntry, CacheStats};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// `DashMap`-backed cache with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<SubjectActionKey, StoredValue>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of an entry, for tests and diagnostics.
    pub fn ttl_remaining(&self, key: &SubjectActionKey) -> Option<std::time::Duration> {
        let entry = self.entries.get(key)?;
        entry.expires_at.checked_duration_since(Instant::now())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get_many(
        &self,
        keys: &[SubjectActionKey],
    ) -> WarrantResult<HashMap<SubjectActionKey, Vec<u8>>> {
        let now = Instant::now();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            // Read guard must be dropped before remove_if touches the shard.
            let lookup = self
                .entries
                .get(key)
                .map(|stored| (stored.expires_at > now).then(|| stored.value.clone()));
            let live = match lookup {
                Some(Some(value)) => Some(value),
                Some(None) => {
                    self.entries.remove_if(key, |_, v| v.expires_at <= now);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                None => None,
            };
            match live {
                Some(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    found.insert(key.clone(), value);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(found)
    }

    async fn set_many(&self, entries: Vec<CacheEntry>) -> WarrantResult<()> {
        let now = Instant::now();
        for entry in entries {
            self.entries.insert(
                entry.key,
                StoredValue {
                    value: entry.value,
                    expires_at: now + entry.ttl,
                },
            );
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[SubjectActionKey]) -> WarrantResult<u64> {
        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .count() as u64)
    }

    async fn stats(&self) -> WarrantResult<CacheStats> {
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
