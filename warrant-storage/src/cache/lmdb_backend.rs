//! LMDB-backed cache shared by worker processes on one host.
//!
//! Uses the heed crate (Rust bindings for LMDB): a memory-mapped key-value
//! store several processes can open at once, so workers on a host share
//! one expression cache.
//!
//! # Value Format
//!
//! `[expires_at: 8 bytes, unix millis LE][payload]`. The payload may be
//! empty (negative entry). Expired entries read as misses and are deleted
//! lazily, or in bulk by [`LmdbCacheBackend::purge_expired`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use warrant_core::{CacheError, WarrantError, WarrantResult};

use super::key::SubjectActionKey;
use super::traits::{CacheBackend, CacheEntry, CacheStats};

const EXPIRY_PREFIX_LEN: usize = 8;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for WarrantError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Transaction(reason) => CacheError::Transaction { reason }.into(),
            other => CacheError::Backend {
                reason: other.to_string(),
            }
            .into(),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

/// LMDB-backed cache.
pub struct LmdbCacheBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LmdbCacheBackend {
    /// Open (or create) the cache under `path` with a map of `max_size_mb`.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per process for this path
        // and never mapped with a different size while open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    fn encode_value(value: &[u8], expires_at_ms: i64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(EXPIRY_PREFIX_LEN + value.len());
        bytes.extend_from_slice(&expires_at_ms.to_le_bytes());
        bytes.extend_from_slice(value);
        bytes
    }

    /// Split a stored value into (expires_at_ms, payload).
    fn decode_value(bytes: &[u8]) -> Option<(i64, &[u8])> {
        if bytes.len() < EXPIRY_PREFIX_LEN {
            return None;
        }
        let expiry: [u8; EXPIRY_PREFIX_LEN] = bytes[..EXPIRY_PREFIX_LEN].try_into().ok()?;
        Some((i64::from_le_bytes(expiry), &bytes[EXPIRY_PREFIX_LEN..]))
    }

    fn delete_raw(&self, keys: &[Vec<u8>]) -> Result<u64, LmdbCacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in keys {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    /// Collect keys whose stored record satisfies `pred(key, value)`.
    fn collect_keys<F>(&self, mut pred: F) -> Result<Vec<Vec<u8>>, LmdbCacheError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, value) = result.map_err(txn_err)?;
            if pred(key, value) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }

    /// Delete every entry whose TTL has passed.
    pub fn purge_expired(&self) -> Result<u64, LmdbCacheError> {
        let now_ms = Utc::now().timestamp_millis();
        let keys = self.collect_keys(|_, value| match Self::decode_value(value) {
            Some((expires_at_ms, _)) => expires_at_ms <= now_ms,
            None => true,
        })?;
        let deleted = self.delete_raw(&keys)?;
        self.evictions.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    /// Delete every entry written under a namespace other than `version`.
    pub fn purge_other_namespaces(&self, version: &str) -> Result<u64, LmdbCacheError> {
        let prefix = SubjectActionKey::namespace_prefix(version);
        let keys = self.collect_keys(|key, _| !key.starts_with(&prefix))?;
        self.delete_raw(&keys)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get_many(
        &self,
        keys: &[SubjectActionKey],
    ) -> WarrantResult<HashMap<SubjectActionKey, Vec<u8>>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut found = HashMap::with_capacity(keys.len());
        let mut expired = Vec::new();
        {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            for key in keys {
                let encoded = key.encode();
                let stored = self.db.get(&rtxn, &encoded).map_err(txn_err)?;
                match stored.and_then(Self::decode_value) {
                    Some((expires_at_ms, payload)) if expires_at_ms > now_ms => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        found.insert(key.clone(), payload.to_vec());
                    }
                    Some(_) => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        expired.push(encoded);
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if !expired.is_empty() {
            match self.delete_raw(&expired) {
                Ok(deleted) => {
                    self.evictions.fetch_add(deleted, Ordering::Relaxed);
                }
                Err(e) => tracing::debug!(error = %e, "Lazy LMDB expiry failed"),
            }
        }

        Ok(found)
    }

    async fn set_many(&self, entries: Vec<CacheEntry>) -> WarrantResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now_ms = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for entry in &entries {
            let expires_at_ms = now_ms.saturating_add(entry.ttl.as_millis() as i64);
            let value = Self::encode_value(&entry.value, expires_at_ms);
            self.db
                .put(&mut wtxn, &entry.key.encode(), &value)
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[SubjectActionKey]) -> WarrantResult<u64> {
        let encoded: Vec<_> = keys.iter().map(SubjectActionKey::encode).collect();
        Ok(self.delete_raw(&encoded)?)
    }

    async fn stats(&self) -> WarrantResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let entry_count = self.db.len(&rtxn).map_err(txn_err)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}
