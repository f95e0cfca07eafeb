//! Queue Consumer
//!
//! Pulls batch tokens off the [`WorkQueue`] and hands them to the
//! [`RecomputeHandler`]. The acknowledgement policy:
//!
//! | handler result | queue action |
//! |---|---|
//! | `Ok(_)` (completed, already processed, abandoned) | ack |
//! | validation error (malformed token) | ack, logged as poison |
//! | any other error | requeue |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use warrant_core::constants::{DEFAULT_CONSUMER_POLL_MS, DEFAULT_CONSUMER_WORKERS};
use warrant_core::{WarrantError, WarrantResult};
use warrant_storage::{CacheBackend, Delivery, PipelineStore, WorkQueue};

use crate::handler::{HandleOutcome, RecomputeHandler};
use crate::metrics as prom;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for queue consumers.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of consumer tasks (default: 4)
    pub workers: usize,

    /// Sleep between polls of an idle queue (default: 500ms)
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_CONSUMER_WORKERS,
            poll_interval: Duration::from_millis(DEFAULT_CONSUMER_POLL_MS),
        }
    }
}

impl ConsumerConfig {
    /// Create ConsumerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARRANT_CONSUMER_WORKERS`: Consumer task count (default: 4)
    /// - `WARRANT_CONSUMER_POLL_MS`: Idle poll interval (default: 500)
    pub fn from_env() -> Self {
        let workers = std::env::var("WARRANT_CONSUMER_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONSUMER_WORKERS);

        let poll_interval = Duration::from_millis(
            std::env::var("WARRANT_CONSUMER_POLL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONSUMER_POLL_MS),
        );

        Self {
            workers,
            poll_interval,
        }
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_millis(10),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for one consumer task.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Deliveries received
    pub received: AtomicU64,

    /// Deliveries acknowledged
    pub acked: AtomicU64,

    /// Deliveries requeued for retry
    pub requeued: AtomicU64,

    /// Malformed tokens dropped
    pub poison: AtomicU64,

    /// Queue failures (receive, ack, requeue)
    pub queue_errors: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of consumer metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub poison: u64,
    pub queue_errors: u64,
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Nothing to receive.
    Idle,
    /// Delivery handled and acknowledged.
    Handled(Option<HandleOutcome>),
    /// Delivery failed and was put back.
    Requeued,
}

// ============================================================================
// CONSUME
// ============================================================================

/// Receive at most one delivery and settle it.
///
/// Returns an error only when the queue itself fails.
pub async fn consume_one<S, C, Q>(
    handler: &RecomputeHandler<S, C>,
    queue: &Q,
    metrics: &ConsumerMetrics,
) -> WarrantResult<ConsumeOutcome>
where
    S: PipelineStore,
    C: CacheBackend,
    Q: WorkQueue + ?Sized,
{
    let Some(delivery) = queue.receive().await? else {
        return Ok(ConsumeOutcome::Idle);
    };
    metrics.received.fetch_add(1, Ordering::Relaxed);

    match handler.handle(&delivery.token).await {
        Ok(outcome) => {
            prom::record_batch_handled(outcome.label());
            ack(queue, &delivery, metrics).await?;
            Ok(ConsumeOutcome::Handled(Some(outcome)))
        }
        Err(WarrantError::Validation(e)) => {
            metrics.poison.fetch_add(1, Ordering::Relaxed);
            prom::record_batch_handled("poison");
            tracing::error!(error = %e, token = %delivery.token, "Dropping undecodable delivery");
            ack(queue, &delivery, metrics).await?;
            Ok(ConsumeOutcome::Handled(None))
        }
        Err(e) => {
            prom::record_batch_handled("retry");
            if e.is_need_retry() {
                tracing::warn!(error = %e, token = %delivery.token, attempt = delivery.attempt, "Batch hit lock contention, requeueing");
            } else {
                tracing::error!(error = %e, token = %delivery.token, attempt = delivery.attempt, "Batch failed, requeueing");
            }
            if let Err(requeue_err) = queue.requeue(&delivery).await {
                metrics.queue_errors.fetch_add(1, Ordering::Relaxed);
                return Err(requeue_err);
            }
            metrics.requeued.fetch_add(1, Ordering::Relaxed);
            Ok(ConsumeOutcome::Requeued)
        }
    }
}

async fn ack<Q>(queue: &Q, delivery: &Delivery, metrics: &ConsumerMetrics) -> WarrantResult<()>
where
    Q: WorkQueue + ?Sized,
{
    if let Err(e) = queue.ack(delivery).await {
        metrics.queue_errors.fetch_add(1, Ordering::Relaxed);
        return Err(e);
    }
    metrics.acked.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// One consumer loop. Polls back-to-back while work is available and sleeps
/// `poll_interval` when idle, after a requeue, or after a queue failure.
pub async fn consumer_task<S, C, Q>(
    worker_id: usize,
    handler: Arc<RecomputeHandler<S, C>>,
    queue: Arc<Q>,
    config: ConsumerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ConsumerMetrics>
where
    S: PipelineStore,
    C: CacheBackend,
    Q: WorkQueue + ?Sized + 'static,
{
    let metrics = Arc::new(ConsumerMetrics::new());

    tracing::info!(
        worker_id,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Queue consumer started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let pause = match consume_one(handler.as_ref(), queue.as_ref(), &metrics).await {
            Ok(ConsumeOutcome::Handled(_)) => None,
            Ok(ConsumeOutcome::Idle) | Ok(ConsumeOutcome::Requeued) => Some(config.poll_interval),
            Err(e) => {
                metrics.queue_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker_id, error = %e, "Queue operation failed");
                Some(config.poll_interval)
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        worker_id,
        received = snapshot.received,
        acked = snapshot.acked,
        requeued = snapshot.requeued,
        poison = snapshot.poison,
        queue_errors = snapshot.queue_errors,
        "Queue consumer completed"
    );

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use crate::locker::{DistributedLocker, LockConfig};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use warrant_core::{now_unix, SubjectActionAlterMessage, SubjectActionGroupMessage};
    use warrant_storage::{
        BatchStore, CacheConfig, ExpressionCache, InMemoryCacheBackend, InMemoryLockBackend,
        InMemoryQueue, LockBackend, MockStore,
    };

    fn handler(
        store: Arc<MockStore>,
        locks: Arc<InMemoryLockBackend>,
    ) -> RecomputeHandler<MockStore, InMemoryCacheBackend> {
        let cache = Arc::new(ExpressionCache::new(
            store.clone(),
            Arc::new(InMemoryCacheBackend::new()),
            CacheConfig::default(),
        ));
        RecomputeHandler::new(
            store,
            DistributedLocker::new(locks, LockConfig::development()),
            cache,
            HandlerConfig::default(),
        )
    }

    async fn seeded_batch(store: &MockStore) -> String {
        store.add_action(3, 10);
        store.add_resource_type(10, "host");
        store.add_membership(7, 1, now_unix() + 3600);
        store.set_grant(1, 3, BTreeMap::from([(10, vec!["100".to_string()])]));
        let batch = SubjectActionAlterMessage::new(
            vec![SubjectActionGroupMessage {
                subject_pk: 7,
                action_pk: 3,
                group_pks: vec![1],
            }],
            Utc::now(),
        );
        store.batch_commit_transfer(&[batch.clone()], &[]).await.unwrap();
        batch.token()
    }

    #[tokio::test]
    async fn test_idle_queue() {
        let store = Arc::new(MockStore::new());
        let handler = handler(store, Arc::new(InMemoryLockBackend::new()));
        let queue = InMemoryQueue::new();
        let outcome = consume_one(&handler, &queue, &ConsumerMetrics::new())
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Idle);
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let store = Arc::new(MockStore::new());
        let handler = handler(store.clone(), Arc::new(InMemoryLockBackend::new()));
        let queue = InMemoryQueue::new();
        let metrics = ConsumerMetrics::new();
        queue.publish(&[seeded_batch(&store).await]).await.unwrap();

        let outcome = consume_one(&handler, &queue, &metrics).await.unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::Handled(Some(HandleOutcome::Completed { entries: 1 }))
        );
        assert_eq!(queue.unacked_len(), 0);
        assert!(queue.ready_tokens().is_empty());
        assert!(store.expression((7, 3)).is_some());
    }

    #[tokio::test]
    async fn test_poison_token_is_acked() {
        let store = Arc::new(MockStore::new());
        let handler = handler(store, Arc::new(InMemoryLockBackend::new()));
        let queue = InMemoryQueue::new();
        let metrics = ConsumerMetrics::new();
        queue.publish(&["garbage".to_string()]).await.unwrap();

        let outcome = consume_one(&handler, &queue, &metrics).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Handled(None));
        assert_eq!(queue.unacked_len(), 0);
        assert!(queue.ready_tokens().is_empty());
        assert_eq!(metrics.snapshot().poison, 1);
    }

    #[tokio::test]
    async fn test_lock_contention_is_requeued() {
        let store = Arc::new(MockStore::new());
        let locks = Arc::new(InMemoryLockBackend::new());
        let handler = handler(store.clone(), locks.clone());
        let queue = InMemoryQueue::new();
        let metrics = ConsumerMetrics::new();
        let token = seeded_batch(&store).await;
        queue.publish(&[token.clone()]).await.unwrap();

        let _held = locks
            .try_acquire(&handler_key(&handler), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = consume_one(&handler, &queue, &metrics).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Requeued);
        assert_eq!(queue.ready_tokens(), vec![token]);
        assert_eq!(store.batches().len(), 1);
    }

    fn handler_key(
        handler: &RecomputeHandler<MockStore, InMemoryCacheBackend>,
    ) -> warrant_storage::LockKey {
        handler.locker().key(7, 3)
    }

    #[tokio::test]
    async fn test_task_drains_queue_then_stops() {
        let store = Arc::new(MockStore::new());
        let handler = Arc::new(handler(store.clone(), Arc::new(InMemoryLockBackend::new())));
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(&[seeded_batch(&store).await]).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(consumer_task(
            0,
            handler,
            queue.clone(),
            ConsumerConfig::development(),
            rx,
        ));

        for _ in 0..100 {
            if store.batches().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        let metrics = task.await.unwrap();

        assert!(store.batches().is_empty());
        assert_eq!(metrics.snapshot().acked, 1);
    }
}
