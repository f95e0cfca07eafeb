//! Cache backend trait.
//!
//! Backends store opaque bytes per key with a per-entry TTL. An empty value
//! is a legal entry (the read path uses it as its negative sentinel), so a
//! backend must distinguish "stored empty" from "absent".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use warrant_core::WarrantResult;

use super::key::SubjectActionKey;

/// One write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: SubjectActionKey,
    pub value: Vec<u8>,
    pub ttl: Duration,
}

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe to share between tasks. Cache state is
/// best-effort: callers treat errors as misses.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Fetch every live entry among `keys`. Absent or expired keys are
    /// missing from the result.
    async fn get_many(
        &self,
        keys: &[SubjectActionKey],
    ) -> WarrantResult<HashMap<SubjectActionKey, Vec<u8>>>;

    async fn set_many(&self, entries: Vec<CacheEntry>) -> WarrantResult<()>;

    /// Delete `keys`, returning how many existed.
    async fn delete_many(&self, keys: &[SubjectActionKey]) -> WarrantResult<u64>;

    async fn stats(&self) -> WarrantResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses (absent or TTL-expired).
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Number of entries dropped because their TTL passed.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
