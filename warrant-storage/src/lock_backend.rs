//! Lock backends for per-(subject, action) mutual exclusion.
//!
//! A backend only offers a single non-blocking attempt; retry, backoff and
//! deadlines belong to the caller.

use std::time::Duration;

use ::async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use warrant_core::{ActionPk, LockData, SubjectPk, WarrantResult};

const LOCK_PREFIX: &str = "warrant";

/// Lock key for a (subject, action) pair inside a versioned namespace.
///
/// Format: `warrant:{version}:lock:subject_action:{subject}:{action}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn subject_action(version: &str, subject_pk: SubjectPk, action_pk: ActionPk) -> Self {
        Self(format!(
            "{}:{}:lock:subject_action:{}:{}",
            LOCK_PREFIX, version, subject_pk, action_pk
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// One acquisition attempt. `None` means someone else holds an unexpired
    /// lock on `key`.
    async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> WarrantResult<Option<LockData>>;

    /// Release if `lock.token` still owns the key. Returns whether a row was
    /// removed; `false` means the lock expired and possibly changed hands.
    async fn release(&self, lock: &LockData) -> WarrantResult<bool>;
}

/// Process-local lock table.
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    locks: DashMap<String, LockData>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently recorded (held or expired-but-unreclaimed).
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> WarrantResult<Option<LockData>> {
        let now = Utc::now();
        match self.locks.entry(key.as_str().to_string()) {
            Entry::Occupied(mut held) => {
                if !held.get().is_expired(now) {
                    return Ok(None);
                }
                let data = LockData::new(key.as_str(), now, ttl);
                held.insert(data.clone());
                Ok(Some(data))
            }
            Entry::Vacant(slot) => {
                let data = LockData::new(key.as_str(), now, ttl);
                slot.insert(data.clone());
                Ok(Some(data))
            }
        }
    }

    async fn release(&self, lock: &LockData) -> WarrantResult<bool> {
        Ok(self
            .locks
            .remove_if(&lock.key, |_, held| held.token == lock.token)
            .is_some())
    }
}
