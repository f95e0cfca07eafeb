//! WARRANT Worker Entry Point
//!
//! Connects to PostgreSQL, applies the schema, picks a cache backend and
//! runs the transfer, checker and consumer tasks until Ctrl-C.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use warrant_core::WarrantResult;
use warrant_pipeline::{
    checker_task, consumer_task, init_tracing, transfer_task, ChangeProducer, DistributedLocker,
    RecomputeHandler, WorkerConfig,
};
use warrant_storage::{
    CacheBackend, ExpressionCache, InMemoryCacheBackend, LmdbCacheBackend, LockBackend, PgQueue,
    PgStore,
};

#[tokio::main]
async fn main() -> WarrantResult<()> {
    let config = WorkerConfig::from_env();
    init_tracing(&config.telemetry)?;

    let store = Arc::new(PgStore::from_config(&config.db)?);
    store.migrate().await?;
    tracing::info!(
        host = %config.db.host,
        database = %config.db.dbname,
        pool_size = store.pool_size(),
        "Connected to PostgreSQL"
    );

    match config.lmdb_path.clone() {
        Some(path) => {
            let backend = LmdbCacheBackend::new(&path, config.lmdb_max_mb)?;
            let purged = backend.purge_other_namespaces(&config.cache.version)?;
            tracing::info!(path = %path.display(), purged, "Using LMDB cache backend");
            run(config, store, Arc::new(backend)).await
        }
        None => {
            tracing::info!("Using in-memory cache backend");
            run(config, store, Arc::new(InMemoryCacheBackend::new())).await
        }
    }
}

async fn run<C: CacheBackend>(
    config: WorkerConfig,
    store: Arc<PgStore>,
    backend: Arc<C>,
) -> WarrantResult<()> {
    let queue = Arc::new(PgQueue::new(store.pool().clone()).with_visibility(config.queue_visibility));

    let producer = Arc::new(ChangeProducer::new(Arc::clone(&store), config.producer.clone()));
    let cache = Arc::new(
        ExpressionCache::new(Arc::clone(&store), backend, config.cache.clone())
            .with_notifier(producer),
    );
    let lock_backend: Arc<dyn LockBackend> = store.clone();
    let locker = DistributedLocker::new(lock_backend, config.lock.clone());
    let handler = Arc::new(RecomputeHandler::new(
        Arc::clone(&store),
        locker,
        cache,
        config.handler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let transfer = tokio::spawn(transfer_task(
        Arc::clone(&store),
        Arc::clone(&queue),
        config.transfer.clone(),
        shutdown_rx.clone(),
    ));
    let checker = tokio::spawn(checker_task(
        Arc::clone(&store),
        Arc::clone(&queue),
        config.checker.clone(),
        shutdown_rx.clone(),
    ));
    let consumers: Vec<JoinHandle<_>> = (0..config.consumer.workers)
        .map(|worker_id| {
            tokio::spawn(consumer_task(
                worker_id,
                Arc::clone(&handler),
                Arc::clone(&queue),
                config.consumer.clone(),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    tracing::info!(consumers = consumers.len(), "WARRANT worker running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    match transfer.await {
        Ok(metrics) => tracing::info!(snapshot = ?metrics.snapshot(), "Transfer task joined"),
        Err(e) => tracing::error!(error = %e, "Transfer task panicked"),
    }
    match checker.await {
        Ok(metrics) => tracing::info!(snapshot = ?metrics.snapshot(), "Checker task joined"),
        Err(e) => tracing::error!(error = %e, "Checker task panicked"),
    }
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::error!(error = %e, "Consumer task panicked");
        }
    }

    let cache_stats = handler.cache().metrics().snapshot();
    tracing::info!(metrics = %warrant_pipeline::metrics::gather_text(), "Final metrics");
    tracing::info!(snapshot = ?cache_stats, "WARRANT worker stopped");
    Ok(())
}
