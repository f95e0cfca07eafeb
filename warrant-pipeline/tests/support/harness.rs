//! In-process pipeline wired over the mock store, queue, lock and cache.

#![allow(dead_code)]

use std::sync::Arc;

use warrant_pipeline::jobs::{transfer_once, TransferConfig, TransferMetrics, TransferReport};
use warrant_pipeline::{
    consume_one, ChangeProducer, ConsumeOutcome, ConsumerMetrics, DistributedLocker,
    HandlerConfig, LockConfig, ProducerConfig, RecomputeHandler,
};
use warrant_storage::{
    CacheConfig, ExpressionCache, InMemoryCacheBackend, InMemoryLockBackend, InMemoryQueue,
};
use warrant_test_utils::fixtures::catalog_store;
use warrant_test_utils::MockStore;

pub type TestCache = ExpressionCache<MockStore, InMemoryCacheBackend>;
pub type TestHandler = RecomputeHandler<MockStore, InMemoryCacheBackend>;

pub struct Pipeline {
    pub store: Arc<MockStore>,
    pub queue: Arc<InMemoryQueue>,
    pub locks: Arc<InMemoryLockBackend>,
    pub producer: Arc<ChangeProducer<MockStore>>,
    pub cache: Arc<TestCache>,
    pub handler: Arc<TestHandler>,
    pub transfer: TransferConfig,
    pub transfer_metrics: TransferMetrics,
    pub consumer_metrics: ConsumerMetrics,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_store(catalog_store())
    }

    pub fn with_store(store: MockStore) -> Self {
        let store = Arc::new(store);
        let queue = Arc::new(InMemoryQueue::new());
        let locks = Arc::new(InMemoryLockBackend::new());
        let producer = Arc::new(ChangeProducer::new(
            Arc::clone(&store),
            ProducerConfig::default(),
        ));
        let cache = Arc::new(
            ExpressionCache::new(
                Arc::clone(&store),
                Arc::new(InMemoryCacheBackend::new()),
                CacheConfig::default(),
            )
            .with_notifier(producer.clone()),
        );
        let handler = Arc::new(RecomputeHandler::new(
            Arc::clone(&store),
            DistributedLocker::new(locks.clone(), LockConfig::development()),
            Arc::clone(&cache),
            HandlerConfig::default(),
        ));

        Self {
            store,
            queue,
            locks,
            producer,
            cache,
            handler,
            transfer: TransferConfig::development(),
            transfer_metrics: TransferMetrics::new(),
            consumer_metrics: ConsumerMetrics::new(),
        }
    }

    pub async fn transfer(&self) -> TransferReport {
        transfer_once(
            self.store.as_ref(),
            self.queue.as_ref(),
            &self.transfer,
            &self.transfer_metrics,
        )
        .await
        .expect("transfer")
    }

    /// Consume until the queue is idle or a delivery is requeued.
    pub async fn drain(&self) -> Vec<ConsumeOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = consume_one(
                self.handler.as_ref(),
                self.queue.as_ref(),
                &self.consumer_metrics,
            )
            .await
            .expect("consume");
            match outcome {
                ConsumeOutcome::Idle => break,
                ConsumeOutcome::Requeued => {
                    outcomes.push(outcome);
                    break;
                }
                ConsumeOutcome::Handled(_) => outcomes.push(outcome),
            }
        }
        outcomes
    }

    /// Transfer then drain.
    pub async fn settle(&self) -> TransferReport {
        let report = self.transfer().await;
        self.drain().await;
        report
    }
}
