//! Lock typestate for compile-time safety of lock lifecycle.
//!
//! A lock can only be released while it is in the Acquired state, and
//! releasing consumes it.
//!
//! ```text
//! (unlocked) ─── try_acquire() ──→ Acquired ─── release() ──→ (unlocked)
//! ```

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

use crate::Timestamp;

// ============================================================================
// LOCK DATA (internal storage, state-independent)
// ============================================================================

/// What a lock backend records for a held lock.
///
/// The token identifies this particular holder; release only succeeds when
/// the stored token still matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockData {
    pub key: String,
    pub token: Uuid,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LockData {
    /// A new holder record for `key` valid for `ttl` from `now`.
    pub fn new(key: impl Into<String>, now: Timestamp, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(ttl.as_millis() as i64));
        Self {
            key: key.into(),
            token: crate::new_entity_id(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if the lock has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lock is currently held (acquired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
}

// ============================================================================
// LOCK TYPESTATE WRAPPER
// ============================================================================

/// A lock with compile-time state tracking.
#[derive(Debug)]
pub struct Lock<S: LockState> {
    data: LockData,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    /// Access the underlying lock data (read-only).
    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn key(&self) -> &str {
        &self.data.key
    }

    pub fn token(&self) -> Uuid {
        self.data.token
    }
}

impl Lock<Acquired> {
    /// Wrap data returned by a successful acquire.
    pub fn new(data: LockData) -> Self {
        Lock {
            data,
            _state: PhantomData,
        }
    }

    /// Release the lock and return the data the backend must delete.
    pub fn release(self) -> LockData {
        self.data
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        self.data.remaining_duration(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_lock_data_expiry() {
        let now = Utc::now();
        let data = LockData::new("warrant:1:lock:subject_action:7:3", now, Duration::from_secs(120));

        assert!(!data.is_expired(now));
        assert!(data.is_expired(now + chrono::Duration::seconds(120)));
        let remaining = data.remaining_duration(now).unwrap();
        assert_eq!(remaining, Duration::from_secs(120));
    }

    #[test]
    fn test_tokens_are_unique_per_acquire() {
        let now = Utc::now();
        let a = LockData::new("k", now, Duration::from_secs(1));
        let b = LockData::new("k", now, Duration::from_secs(1));
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_lock_release_consumes() {
        let data = LockData::new("k", Utc::now(), Duration::from_secs(5));
        let lock = Lock::<Acquired>::new(data.clone());
        assert_eq!(lock.key(), "k");

        let released = lock.release();
        assert_eq!(released.token, data.token);
        // lock is now consumed and cannot be used
    }
}
