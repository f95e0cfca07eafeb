//! Distributed Locker
//!
//! Per-(subject, action) mutual exclusion over a [`LockBackend`]. Acquire
//! retries with linear backoff until a deadline; failing to acquire in time
//! is a retryable [`LockError::NotObtained`].
//!
//! The returned [`LockGuard`] should be released explicitly. A guard dropped
//! while still held (error path, panic, cancelled task) schedules the
//! release on the current runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;
use warrant_core::constants::{
    DEFAULT_CACHE_VERSION, DEFAULT_LOCK_DEADLINE_SECS, DEFAULT_LOCK_RETRY_MAX_MS,
    DEFAULT_LOCK_RETRY_STEP_MS, DEFAULT_LOCK_TTL_SECS,
};
use warrant_core::{Acquired, ActionPk, Lock, LockError, SubjectPk, WarrantResult};
use warrant_storage::{LockBackend, LockKey};

use crate::metrics;

/// Configuration for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a held lock stays valid without release.
    pub ttl: Duration,
    /// How long `acquire` keeps retrying.
    pub deadline: Duration,
    /// Backoff grows by this much per failed attempt.
    pub retry_step: Duration,
    /// Backoff cap.
    pub retry_max: Duration,
    /// Namespace version embedded in lock keys.
    pub namespace_version: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            deadline: Duration::from_secs(DEFAULT_LOCK_DEADLINE_SECS),
            retry_step: Duration::from_millis(DEFAULT_LOCK_RETRY_STEP_MS),
            retry_max: Duration::from_millis(DEFAULT_LOCK_RETRY_MAX_MS),
            namespace_version: DEFAULT_CACHE_VERSION.to_string(),
        }
    }
}

impl LockConfig {
    /// Create LockConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARRANT_LOCK_TTL_SECS` (default: 120)
    /// - `WARRANT_LOCK_DEADLINE_SECS` (default: 180)
    /// - `WARRANT_LOCK_RETRY_STEP_MS` (default: 50)
    /// - `WARRANT_LOCK_RETRY_MAX_MS` (default: 1000)
    /// - `WARRANT_CACHE_VERSION` (default: 1)
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };
        let millis = |name: &str, default: u64| {
            Duration::from_millis(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        Self {
            ttl: secs("WARRANT_LOCK_TTL_SECS", DEFAULT_LOCK_TTL_SECS),
            deadline: secs("WARRANT_LOCK_DEADLINE_SECS", DEFAULT_LOCK_DEADLINE_SECS),
            retry_step: millis("WARRANT_LOCK_RETRY_STEP_MS", DEFAULT_LOCK_RETRY_STEP_MS),
            retry_max: millis("WARRANT_LOCK_RETRY_MAX_MS", DEFAULT_LOCK_RETRY_MAX_MS),
            namespace_version: std::env::var("WARRANT_CACHE_VERSION")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_string()),
        }
    }

    /// Short timings for development and tests.
    pub fn development() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            deadline: Duration::from_millis(500),
            retry_step: Duration::from_millis(5),
            retry_max: Duration::from_millis(50),
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_step.saturating_mul(attempt).min(self.retry_max)
    }
}

/// Acquires per-pair locks.
#[derive(Clone)]
pub struct DistributedLocker {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl DistributedLocker {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn key(&self, subject_pk: SubjectPk, action_pk: ActionPk) -> LockKey {
        LockKey::subject_action(&self.config.namespace_version, subject_pk, action_pk)
    }

    /// Acquire with the configured deadline.
    pub async fn acquire(&self, subject_pk: SubjectPk, action_pk: ActionPk) -> WarrantResult<LockGuard> {
        self.acquire_with_deadline(subject_pk, action_pk, self.config.deadline)
            .await
    }

    pub async fn acquire_with_deadline(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
        deadline: Duration,
    ) -> WarrantResult<LockGuard> {
        let key = self.key(subject_pk, action_pk);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if let Some(data) = self.backend.try_acquire(&key, self.config.ttl).await? {
                let waited = started.elapsed();
                metrics::record_lock_wait(waited.as_secs_f64());
                if attempt > 0 {
                    tracing::debug!(%key, attempts = attempt + 1, waited_ms = waited.as_millis() as u64, "Lock acquired after contention");
                }
                return Ok(LockGuard {
                    backend: Arc::clone(&self.backend),
                    lock: Some(Lock::new(data)),
                });
            }

            attempt += 1;
            let waited = started.elapsed();
            if waited >= deadline {
                return Err(LockError::NotObtained {
                    key: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                }
                .into());
            }
            let pause = self.config.backoff(attempt).min(deadline - waited);
            tokio::time::sleep(pause).await;
        }
    }
}

/// A held lock.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    lock: Option<Lock<Acquired>>,
}

impl LockGuard {
    pub fn key(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.key())
    }

    pub fn token(&self) -> Option<Uuid> {
        self.lock.as_ref().map(|l| l.token())
    }

    /// Whether the lock TTL has passed (another holder may now own the key).
    pub fn is_expired(&self) -> bool {
        self.lock
            .as_ref()
            .map(|l| l.is_expired(Utc::now()))
            .unwrap_or(true)
    }

    /// Release the lock. Returns `false` if it had already expired and been
    /// taken over or removed.
    pub async fn release(mut self) -> WarrantResult<bool> {
        let Some(lock) = self.lock.take() else {
            return Ok(false);
        };
        let data = lock.release();
        let released = self.backend.release(&data).await?;
        if !released {
            tracing::warn!(key = %data.key, "Lock expired before release");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let data = lock.release();
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.release(&data).await {
                        tracing::warn!(error = %e, key = %data.key, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %data.key, "No runtime for lock release, leaving it to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warrant_storage::InMemoryLockBackend;

    fn locker(backend: Arc<InMemoryLockBackend>) -> DistributedLocker {
        DistributedLocker::new(backend, LockConfig::development())
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let config = LockConfig::development();
        assert_eq!(config.backoff(1), Duration::from_millis(5));
        assert_eq!(config.backoff(3), Duration::from_millis(15));
        assert_eq!(config.backoff(100), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = locker(backend.clone());

        let held = locker.acquire(7, 3).await.unwrap();
        let err = locker
            .acquire_with_deadline(7, 3, Duration::from_millis(30))
            .await
            .err()
            .unwrap();
        assert!(err.is_need_retry());

        // A different pair is independent.
        let other = locker.acquire(7, 4).await.unwrap();

        assert!(held.release().await.unwrap());
        assert!(other.release().await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = locker(backend);

        let held = locker.acquire(1, 1).await.unwrap();
        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire(1, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await.unwrap();

        let acquired = waiter.await.unwrap().unwrap();
        assert!(acquired.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_reports_expiry_after_ttl() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = DistributedLocker::new(
            backend,
            LockConfig {
                ttl: Duration::from_millis(50),
                ..LockConfig::development()
            },
        );

        let guard = locker.acquire(5, 5).await.unwrap();
        assert!(guard.token().is_some());
        assert!(!guard.is_expired());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(guard.is_expired());
        let _ = guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_guard_is_released_in_background() {
        let backend = Arc::new(InMemoryLockBackend::new());
        let locker = locker(backend.clone());

        {
            let _guard = locker.acquire(2, 2).await.unwrap();
        }
        for _ in 0..50 {
            if backend.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(backend.is_empty());
        assert!(locker.acquire(2, 2).await.unwrap().release().await.unwrap());
    }
}
