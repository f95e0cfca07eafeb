//! Pending-Batch Checker Background Task
//!
//! Recovery sweep for batches whose queue message was lost: a publish that
//! failed after the transfer commit, a handler that died mid-batch, or a
//! requeue that never landed. Any batch not touched for `stale_after` and
//! still under the delivery limit has its token republished.
//!
//! Republishing a batch that is also still on the queue is harmless: the
//! handler recomputes idempotently and acknowledges a missing batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use warrant_core::constants::{
    DEFAULT_CHECKER_BATCH_LIMIT, DEFAULT_CHECKER_INTERVAL_SECS, DEFAULT_CHECKER_STALE_AFTER_SECS,
    DEFAULT_MAX_CHECK_COUNT,
};
use warrant_core::{BatchStatus, WarrantResult};
use warrant_storage::{PipelineStore, WorkQueue};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the pending-batch checker.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// How often to sweep (default: 5 minutes)
    pub interval: Duration,

    /// Batches untouched for this long are republished (default: 5 minutes)
    pub stale_after: Duration,

    /// Batches delivered more often than this are left abandoned (default: 3)
    pub max_check_count: i64,

    /// Maximum batches republished per sweep (default: 1000)
    pub batch_limit: usize,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_CHECKER_INTERVAL_SECS),
            stale_after: Duration::from_secs(DEFAULT_CHECKER_STALE_AFTER_SECS),
            max_check_count: DEFAULT_MAX_CHECK_COUNT,
            batch_limit: DEFAULT_CHECKER_BATCH_LIMIT,
        }
    }
}

impl CheckerConfig {
    /// Create CheckerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARRANT_CHECKER_INTERVAL_SECS`: Sweep interval (default: 300)
    /// - `WARRANT_CHECKER_STALE_AFTER_SECS`: Staleness threshold (default: 300)
    /// - `WARRANT_MAX_CHECK_COUNT`: Delivery limit (default: 3)
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("WARRANT_CHECKER_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CHECKER_INTERVAL_SECS),
        );

        let stale_after = Duration::from_secs(
            std::env::var("WARRANT_CHECKER_STALE_AFTER_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CHECKER_STALE_AFTER_SECS),
        );

        let max_check_count = std::env::var("WARRANT_MAX_CHECK_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CHECK_COUNT);

        Self {
            interval,
            stale_after,
            max_check_count,
            batch_limit: DEFAULT_CHECKER_BATCH_LIMIT,
        }
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(2),
            max_check_count: DEFAULT_MAX_CHECK_COUNT,
            batch_limit: 100,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for checker sweeps.
#[derive(Debug, Default)]
pub struct CheckerMetrics {
    /// Total sweeps
    pub sweeps: AtomicU64,

    /// Total batches republished
    pub republished: AtomicU64,

    /// Sweep failures (store or queue)
    pub errors: AtomicU64,
}

impl CheckerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CheckerSnapshot {
        CheckerSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            republished: self.republished.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of checker metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerSnapshot {
    pub sweeps: u64,
    pub republished: u64,
    pub errors: u64,
}

// ============================================================================
// SWEEP
// ============================================================================

/// Republish every stale, not-yet-abandoned batch. Returns how many were
/// republished.
///
/// Republished batches are marked `pushed`, which also moves their
/// `updated_at` forward so the next sweep leaves them alone until they go
/// stale again.
pub async fn check_pending_once<S, Q>(
    store: &S,
    queue: &Q,
    config: &CheckerConfig,
    metrics: &CheckerMetrics,
) -> WarrantResult<usize>
where
    S: PipelineStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);

    let now = Utc::now();
    let stale_after = chrono::Duration::milliseconds(config.stale_after.as_millis() as i64);
    let stale = store
        .batch_list_stale(now - stale_after, config.max_check_count, config.batch_limit)
        .await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let tokens: Vec<String> = stale.iter().map(|b| b.token()).collect();
    queue.publish(&tokens).await?;

    for batch in &stale {
        if let Err(e) = store
            .batch_transition(batch.uuid, batch.status, BatchStatus::Pushed, Utc::now())
            .await
        {
            tracing::warn!(error = %e, batch = %batch.uuid, "Failed to mark republished batch");
        }
    }

    metrics
        .republished
        .fetch_add(stale.len() as u64, Ordering::Relaxed);
    tracing::warn!(batches = stale.len(), "Republished stale batches");

    Ok(stale.len())
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that runs [`check_pending_once`] on an interval until the
/// shutdown signal is received.
pub async fn checker_task<S, Q>(
    store: Arc<S>,
    queue: Arc<Q>,
    config: CheckerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CheckerMetrics>
where
    S: PipelineStore + ?Sized,
    Q: WorkQueue + ?Sized + 'static,
{
    let metrics = Arc::new(CheckerMetrics::new());

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        stale_after_secs = config.stale_after.as_secs(),
        max_check_count = config.max_check_count,
        "Pending batch checker task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Pending batch checker task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = check_pending_once(store.as_ref(), queue.as_ref(), &config, &metrics).await {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "Pending batch sweep failed");
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        republished = snapshot.republished,
        errors = snapshot.errors,
        "Pending batch checker task completed"
    );

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use warrant_core::{SubjectActionAlterMessage, SubjectActionGroupMessage};
    use warrant_storage::{BatchStore, InMemoryQueue, MockStore};

    async fn seed_batch(store: &MockStore, check_count: i64) -> SubjectActionAlterMessage {
        let mut batch = SubjectActionAlterMessage::new(
            vec![SubjectActionGroupMessage {
                subject_pk: 1,
                action_pk: 2,
                group_pks: vec![3],
            }],
            Utc::now(),
        );
        batch.check_count = check_count;
        store.batch_commit_transfer(&[batch.clone()], &[]).await.unwrap();
        store.backdate_batch(batch.uuid, Utc::now() - chrono::Duration::minutes(10));
        batch
    }

    #[tokio::test]
    async fn test_stale_pending_batch_is_republished_once() {
        let store = MockStore::new();
        let queue = InMemoryQueue::new();
        let config = CheckerConfig::development();
        let metrics = CheckerMetrics::new();
        let batch = seed_batch(&store, 0).await;

        assert_eq!(check_pending_once(&store, &queue, &config, &metrics).await.unwrap(), 1);
        assert_eq!(queue.ready_tokens(), vec![batch.token()]);
        assert_eq!(store.batches()[0].status, BatchStatus::Pushed);

        // Freshly touched, so the next sweep skips it.
        assert_eq!(check_pending_once(&store, &queue, &config, &metrics).await.unwrap(), 0);
        assert_eq!(metrics.snapshot().republished, 1);
    }

    #[tokio::test]
    async fn test_abandoned_batch_is_not_republished() {
        let store = MockStore::new();
        let queue = InMemoryQueue::new();
        let config = CheckerConfig::development();
        seed_batch(&store, config.max_check_count + 1).await;

        let republished = check_pending_once(&store, &queue, &config, &CheckerMetrics::new())
            .await
            .unwrap();
        assert_eq!(republished, 0);
        assert!(queue.ready_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned_and_batch_stays_stale() {
        let store = MockStore::new();
        let queue = InMemoryQueue::new();
        queue.set_rejecting_publish(true);
        seed_batch(&store, 0).await;

        let result = check_pending_once(
            &store,
            &queue,
            &CheckerConfig::development(),
            &CheckerMetrics::new(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(store.batches()[0].status, BatchStatus::Pending);
    }
}
