//! Recompute Handler
//!
//! Consumes one batch token. Per `(subject, action, groups)` entry, under the
//! pair's distributed lock:
//!
//! 1. load the stored aggregate (absent means empty)
//! 2. refresh only the listed groups from current membership and grants
//! 3. persist aggregate + expression together, or delete both when empty
//! 4. invalidate the cached expression
//!
//! Any failing entry aborts the batch, which stays in storage for
//! redelivery; re-running an entry is idempotent. Every delivery bumps
//! `check_count`, and a batch past `max_check_count` is abandoned.

use std::sync::Arc;

use chrono::Utc;
use warrant_core::constants::{DEFAULT_MAX_CHECK_COUNT, REFRESH_GROUP_PK};
use warrant_core::{
    now_unix, SubjectActionAlterMessage, SubjectActionGroupMessage, SubjectActionGroupResource,
    WarrantResult,
};
use warrant_storage::{materialize, CacheBackend, ExpressionCache, PipelineStore, RecomputeOutcome};

use crate::locker::DistributedLocker;
use crate::metrics;

/// Configuration for the recompute handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Deliveries allowed before a batch is abandoned.
    pub max_check_count: i64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_check_count: DEFAULT_MAX_CHECK_COUNT,
        }
    }
}

impl HandlerConfig {
    /// Reads `WARRANT_MAX_CHECK_COUNT` (default: 3).
    pub fn from_env() -> Self {
        Self {
            max_check_count: std::env::var("WARRANT_MAX_CHECK_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_CHECK_COUNT),
        }
    }
}

/// What a delivery did with its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Every entry recomputed; batch deleted.
    Completed { entries: usize },
    /// Batch no longer exists (a duplicate delivery already finished it).
    AlreadyProcessed,
    /// Delivery limit exceeded; batch left in storage, not processed.
    Abandoned { check_count: i64 },
}

impl HandleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HandleOutcome::Completed { .. } => "completed",
            HandleOutcome::AlreadyProcessed => "already_processed",
            HandleOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

/// Result of recomputing one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recomputed {
    Persisted,
    Deleted,
}

pub struct RecomputeHandler<S, C>
where
    S: PipelineStore,
    C: CacheBackend,
{
    store: Arc<S>,
    locker: DistributedLocker,
    cache: Arc<ExpressionCache<S, C>>,
    config: HandlerConfig,
}

impl<S, C> RecomputeHandler<S, C>
where
    S: PipelineStore,
    C: CacheBackend,
{
    pub fn new(
        store: Arc<S>,
        locker: DistributedLocker,
        cache: Arc<ExpressionCache<S, C>>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            store,
            locker,
            cache,
            config,
        }
    }

    pub fn locker(&self) -> &DistributedLocker {
        &self.locker
    }

    pub fn cache(&self) -> &ExpressionCache<S, C> {
        &self.cache
    }

    /// Process the batch named by a queue token.
    ///
    /// Errors mean "retry later": the batch was not deleted. A malformed
    /// token yields a validation error, which retrying cannot fix.
    pub async fn handle(&self, token: &str) -> WarrantResult<HandleOutcome> {
        let uuid = SubjectActionAlterMessage::parse_token(token)?;

        let Some(batch) = self.store.batch_begin_processing(uuid, Utc::now()).await? else {
            tracing::debug!(batch = %uuid, "Batch already processed");
            return Ok(HandleOutcome::AlreadyProcessed);
        };

        if batch.check_count > self.config.max_check_count {
            tracing::error!(
                batch = %uuid,
                check_count = batch.check_count,
                max_check_count = self.config.max_check_count,
                entries = batch.messages.len(),
                "Abandoning batch after too many deliveries"
            );
            return Ok(HandleOutcome::Abandoned {
                check_count: batch.check_count,
            });
        }

        for message in &batch.messages {
            if let Err(e) = self.recompute(message).await {
                tracing::warn!(
                    error = %e,
                    batch = %uuid,
                    subject_pk = message.subject_pk,
                    action_pk = message.action_pk,
                    check_count = batch.check_count,
                    "Batch entry failed, leaving batch for retry"
                );
                return Err(e);
            }
        }

        self.store.batch_delete(uuid).await?;
        tracing::info!(batch = %uuid, entries = batch.messages.len(), "Batch processed");
        Ok(HandleOutcome::Completed {
            entries: batch.messages.len(),
        })
    }

    /// Recompute one entry under its pair lock.
    pub async fn recompute(&self, message: &SubjectActionGroupMessage) -> WarrantResult<Recomputed> {
        let guard = self
            .locker
            .acquire(message.subject_pk, message.action_pk)
            .await?;

        let result = self.recompute_locked(message).await;

        if guard.is_expired() {
            tracing::warn!(
                subject_pk = message.subject_pk,
                action_pk = message.action_pk,
                lock_token = ?guard.token(),
                ttl_secs = self.locker.config().ttl.as_secs(),
                "Recompute outlived its lock TTL"
            );
        }

        if let Err(e) = guard.release().await {
            tracing::warn!(
                error = %e,
                subject_pk = message.subject_pk,
                action_pk = message.action_pk,
                "Lock release failed, leaving it to expire"
            );
        }
        result
    }

    async fn recompute_locked(&self, message: &SubjectActionGroupMessage) -> WarrantResult<Recomputed> {
        let (subject_pk, action_pk) = (message.subject_pk, message.action_pk);
        let now = now_unix();

        let mut aggregate = self
            .store
            .aggregate_get(subject_pk, action_pk)
            .await?
            .unwrap_or_else(|| SubjectActionGroupResource::new(subject_pk, action_pk));

        for &group_pk in &message.group_pks {
            if group_pk == REFRESH_GROUP_PK {
                continue;
            }
            let active_until = self
                .store
                .membership_expires_at(subject_pk, group_pk)
                .await?
                .filter(|expires_at| *expires_at > now);

            let Some(expires_at) = active_until else {
                aggregate.remove_group(group_pk);
                continue;
            };

            let resources = self
                .store
                .group_action_resources(group_pk, action_pk)
                .await?;
            if resources.values().all(Vec::is_empty) {
                aggregate.remove_group(group_pk);
            } else {
                aggregate.upsert_group(group_pk, expires_at, resources);
            }
        }

        let (outcome, recomputed) = if aggregate.is_empty() {
            (
                RecomputeOutcome::Delete {
                    subject_pk,
                    action_pk,
                },
                Recomputed::Deleted,
            )
        } else {
            let expression = materialize(self.store.as_ref(), &aggregate, now).await?;
            (
                RecomputeOutcome::Persist {
                    aggregate,
                    expression,
                },
                Recomputed::Persisted,
            )
        };

        self.store.materialized_apply(&outcome).await?;

        let invalidated = self.cache.invalidate(&[(subject_pk, action_pk)]).await;
        metrics::record_cache_invalidation(invalidated.is_ok());
        invalidated?;

        metrics::record_recompute(match recomputed {
            Recomputed::Persisted => "persisted",
            Recomputed::Deleted => "deleted",
        });
        tracing::debug!(subject_pk, action_pk, result = ?recomputed, "Recomputed pair");
        Ok(recomputed)
    }
}
