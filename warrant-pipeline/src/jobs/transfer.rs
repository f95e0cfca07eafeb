//! Batch Transfer Background Task
//!
//! Periodically merges change events into recompute batches:
//!
//! 1. select events older than the safety margin, up to a page
//! 2. expand to `(subject, action) -> {group}` and union across events
//! 3. chunk into batches of at most `batch_max_entries` entries
//! 4. insert batches and delete the consumed events in one transaction
//! 5. publish batch tokens, then mark batches `pushed`
//!
//! A publish failure after commit leaves the batches `pending`; the
//! pending-batch checker republishes them.
//!
//! # Configuration
//!
//! ```rust
//! use warrant_pipeline::jobs::TransferConfig;
//! use std::time::Duration;
//!
//! let config = TransferConfig {
//!     interval: Duration::from_secs(30),
//!     safety_margin: Duration::from_secs(30),
//!     page_limit: 1000,
//!     batch_max_entries: 100,
//! };
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use warrant_core::constants::{
    DEFAULT_BATCH_MAX_ENTRIES, DEFAULT_TRANSFER_INTERVAL_SECS, DEFAULT_TRANSFER_PAGE_LIMIT,
    DEFAULT_TRANSFER_SAFETY_MARGIN_SECS,
};
use warrant_core::{
    BatchStatus, GroupAlterEvent, GroupPk, SubjectActionAlterMessage, SubjectActionGroupMessage,
    SubjectActionPair, WarrantResult,
};
use warrant_storage::{PipelineStore, WorkQueue};

use crate::metrics as prom;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the batch transfer task.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// How often to run (default: 30 seconds)
    pub interval: Duration,

    /// Only events older than this are taken, so same-tick duplicates can
    /// coalesce first (default: 30 seconds)
    pub safety_margin: Duration,

    /// Maximum events read per pass (default: 1000). A full page is
    /// followed by another pass without waiting for the next tick.
    pub page_limit: usize,

    /// Maximum subject-action entries per batch (default: 100)
    pub batch_max_entries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_TRANSFER_INTERVAL_SECS),
            safety_margin: Duration::from_secs(DEFAULT_TRANSFER_SAFETY_MARGIN_SECS),
            page_limit: DEFAULT_TRANSFER_PAGE_LIMIT,
            batch_max_entries: DEFAULT_BATCH_MAX_ENTRIES,
        }
    }
}

impl TransferConfig {
    /// Create TransferConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARRANT_TRANSFER_INTERVAL_SECS`: Run interval (default: 30)
    /// - `WARRANT_TRANSFER_SAFETY_MARGIN_SECS`: Minimum event age (default: 30)
    /// - `WARRANT_TRANSFER_PAGE_LIMIT`: Events per run (default: 1000)
    /// - `WARRANT_BATCH_MAX_ENTRIES`: Entries per batch (default: 100)
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("WARRANT_TRANSFER_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TRANSFER_INTERVAL_SECS),
        );

        let safety_margin = Duration::from_secs(
            std::env::var("WARRANT_TRANSFER_SAFETY_MARGIN_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TRANSFER_SAFETY_MARGIN_SECS),
        );

        let page_limit = std::env::var("WARRANT_TRANSFER_PAGE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_TRANSFER_PAGE_LIMIT);

        let batch_max_entries = std::env::var("WARRANT_BATCH_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_MAX_ENTRIES);

        Self {
            interval,
            safety_margin,
            page_limit,
            batch_max_entries,
        }
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(1),
            safety_margin: Duration::ZERO,
            page_limit: 100,
            batch_max_entries: 10,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for transfer operations.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    /// Total transfer runs
    pub cycles: AtomicU64,

    /// Total change events merged into batches
    pub events_consumed: AtomicU64,

    /// Total batches created
    pub batches_created: AtomicU64,

    /// Total batches published and marked pushed
    pub batches_pushed: AtomicU64,

    /// Publish failures (batches left pending)
    pub publish_errors: AtomicU64,

    /// Store failures
    pub errors: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_pushed: self.batches_pushed.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transfer metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub cycles: u64,
    pub events_consumed: u64,
    pub batches_created: u64,
    pub batches_pushed: u64,
    pub publish_errors: u64,
    pub errors: u64,
}

/// What one transfer run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub events: usize,
    pub batches: Vec<SubjectActionAlterMessage>,
    pub pushed: usize,
}

// ============================================================================
// MERGE
// ============================================================================

/// Union every event's `(subject, action)` pairs into per-pair group sets.
pub fn merge_events(events: &[GroupAlterEvent]) -> BTreeMap<SubjectActionPair, BTreeSet<GroupPk>> {
    let mut merged: BTreeMap<SubjectActionPair, BTreeSet<GroupPk>> = BTreeMap::new();
    for event in events {
        for (group_pk, action_pk, subject_pk) in event.triples() {
            merged
                .entry((subject_pk, action_pk))
                .or_default()
                .insert(group_pk);
        }
    }
    merged
}

/// Chunk merged entries into batches of at most `max_entries`.
pub fn build_batches(
    merged: BTreeMap<SubjectActionPair, BTreeSet<GroupPk>>,
    max_entries: usize,
    now: chrono::DateTime<Utc>,
) -> Vec<SubjectActionAlterMessage> {
    let messages: Vec<SubjectActionGroupMessage> = merged
        .into_iter()
        .map(|((subject_pk, action_pk), groups)| SubjectActionGroupMessage {
            subject_pk,
            action_pk,
            group_pks: groups.into_iter().collect(),
        })
        .collect();

    messages
        .chunks(max_entries.max(1))
        .map(|chunk| SubjectActionAlterMessage::new(chunk.to_vec(), now))
        .collect()
}

// ============================================================================
// TRANSFER
// ============================================================================

/// Run one transfer pass.
///
/// Store failures are returned. A publish failure is not: the batches are
/// durable and stay `pending` for the checker.
pub async fn transfer_once<S, Q>(
    store: &S,
    queue: &Q,
    config: &TransferConfig,
    metrics: &TransferMetrics,
) -> WarrantResult<TransferReport>
where
    S: PipelineStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let now = Utc::now();
    let margin = chrono::Duration::milliseconds(config.safety_margin.as_millis() as i64);
    let events = store
        .event_list_before(now - margin, config.page_limit)
        .await?;
    if events.is_empty() {
        tracing::trace!("Transfer run found no events");
        return Ok(TransferReport::default());
    }

    let consumed: Vec<_> = events.iter().map(|e| e.uuid).collect();
    let batches = build_batches(merge_events(&events), config.batch_max_entries, now);

    store.batch_commit_transfer(&batches, &consumed).await?;
    metrics
        .events_consumed
        .fetch_add(events.len() as u64, Ordering::Relaxed);
    metrics
        .batches_created
        .fetch_add(batches.len() as u64, Ordering::Relaxed);
    prom::record_batches_created(batches.len());

    let tokens: Vec<String> = batches.iter().map(|b| b.token()).collect();
    let pushed = match queue.publish(&tokens).await {
        Ok(()) => mark_pushed(store, &batches).await,
        Err(e) => {
            metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                error = %e,
                batches = batches.len(),
                "Failed to publish batches, leaving them pending"
            );
            0
        }
    };
    metrics
        .batches_pushed
        .fetch_add(pushed as u64, Ordering::Relaxed);

    tracing::info!(
        events = events.len(),
        batches = batches.len(),
        pushed,
        "Transferred change events"
    );

    Ok(TransferReport {
        events: events.len(),
        batches,
        pushed,
    })
}

/// Move published batches from `pending` to `pushed` and return how many
/// moved. A batch a handler already claimed is left alone and not counted.
async fn mark_pushed<S>(store: &S, batches: &[SubjectActionAlterMessage]) -> usize
where
    S: PipelineStore + ?Sized,
{
    let mut pushed = 0;
    for batch in batches {
        match store
            .batch_transition(batch.uuid, BatchStatus::Pending, BatchStatus::Pushed, Utc::now())
            .await
        {
            Ok(true) => pushed += 1,
            Ok(false) => {
                tracing::debug!(batch = %batch.uuid, "Batch already claimed before marking pushed");
            }
            Err(e) => {
                tracing::warn!(error = %e, batch = %batch.uuid, "Failed to mark batch pushed");
            }
        }
    }
    pushed
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run passes until one reads less than a full page, fails, or shutdown
/// is signalled. Returns the number of passes run.
async fn drain_backlog<S, Q>(
    store: &S,
    queue: &Q,
    config: &TransferConfig,
    metrics: &TransferMetrics,
    shutdown_rx: &watch::Receiver<bool>,
) -> usize
where
    S: PipelineStore + ?Sized,
    Q: WorkQueue + ?Sized,
{
    let mut passes = 0;
    loop {
        passes += 1;
        match transfer_once(store, queue, config, metrics).await {
            Ok(report) if config.page_limit > 0 && report.events >= config.page_limit => {
                if *shutdown_rx.borrow() {
                    break;
                }
                tracing::debug!(events = report.events, passes, "Full page transferred, running again");
            }
            Ok(_) => break,
            Err(e) => {
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Batch transfer failed");
                break;
            }
        }
    }
    passes
}

/// Background task that runs [`transfer_once`] on an interval until the
/// shutdown signal is received.
///
/// A pass that reads a full `page_limit` of events is followed by another
/// pass straight away; the task only waits for the next tick once a page
/// comes back short.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn transfer_task<S, Q>(
    store: Arc<S>,
    queue: Arc<Q>,
    config: TransferConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<TransferMetrics>
where
    S: PipelineStore + ?Sized,
    Q: WorkQueue + ?Sized + 'static,
{
    let metrics = Arc::new(TransferMetrics::new());

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        safety_margin_secs = config.safety_margin.as_secs(),
        page_limit = config.page_limit,
        batch_max_entries = config.batch_max_entries,
        "Batch transfer task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Batch transfer task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                drain_backlog(store.as_ref(), queue.as_ref(), &config, &metrics, &shutdown_rx).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        events_consumed = snapshot.events_consumed,
        batches_created = snapshot.batches_created,
        batches_pushed = snapshot.batches_pushed,
        publish_errors = snapshot.publish_errors,
        errors = snapshot.errors,
        "Batch transfer task completed"
    );

    metrics
}
