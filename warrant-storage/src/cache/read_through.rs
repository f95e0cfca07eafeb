//! Read-through cache of materialized expressions.
//!
//! Reads are served from the cache backend; misses fall back to one batched
//! store query and are written back with a jittered TTL. A zero-length value
//! is the negative sentinel ("confirmed no expression"). Entries whose
//! business expiry has passed are re-derived from the stored aggregate
//! under per-key coalescing, and a refresh change event is emitted in the
//! background so the pipeline converges the stored row too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use warrant_core::constants::{
    DEFAULT_CACHE_JITTER_SECS, DEFAULT_CACHE_TTL_SECS, DEFAULT_CACHE_VERSION,
};
use warrant_core::{
    now_unix, ActionPk, SubjectActionExpression, SubjectActionPair, SubjectPk, WarrantResult,
};

use super::key::SubjectActionKey;
use super::singleflight::SingleFlight;
use super::traits::{CacheBackend, CacheEntry};
use crate::materialize::materialize;
use crate::{GrantSource, MaterializedStore};

/// Configuration for the read-through cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace version embedded in every key.
    pub version: String,
    /// TTL applied to every written entry before jitter.
    pub base_ttl: Duration,
    /// Upper bound of the random TTL addition.
    pub max_jitter: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            base_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_jitter: Duration::from_secs(DEFAULT_CACHE_JITTER_SECS),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WARRANT_CACHE_VERSION`: key namespace version (default: 1)
    /// - `WARRANT_CACHE_TTL_SECS`: base TTL (default: 7 days)
    /// - `WARRANT_CACHE_JITTER_SECS`: max TTL jitter (default: 60)
    pub fn from_env() -> Self {
        Self {
            version: std::env::var("WARRANT_CACHE_VERSION")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CACHE_VERSION.to_string()),
            base_ttl: Duration::from_secs(
                std::env::var("WARRANT_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            max_jitter: Duration::from_secs(
                std::env::var("WARRANT_CACHE_JITTER_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CACHE_JITTER_SECS),
            ),
        }
    }

    /// Set the namespace version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the base TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.base_ttl = ttl;
        self
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Base TTL plus a uniform random jitter in `[0, max_jitter]`.
    pub fn jittered_ttl(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return self.base_ttl;
        }
        self.base_ttl + Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Receives "this pair's stored expression has expired" notices from the
/// read path.
#[async_trait]
pub trait RefreshNotifier: Send + Sync {
    async fn notify_expired(&self, subject_pk: SubjectPk, action_pk: ActionPk) -> WarrantResult<()>;
}

/// Outcome of a batched lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchGetResult {
    /// Valid expressions, in request order.
    pub hits: Vec<SubjectActionExpression>,
    /// Pairs with no valid expression.
    pub misses: Vec<SubjectActionPair>,
}

/// Counters for the read path.
#[derive(Debug, Default)]
pub struct ExpressionCacheMetrics {
    pub hits: AtomicU64,
    pub negative_hits: AtomicU64,
    pub store_loads: AtomicU64,
    pub refreshes: AtomicU64,
    pub backend_errors: AtomicU64,
}

/// Snapshot of read path counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionCacheSnapshot {
    pub hits: u64,
    pub negative_hits: u64,
    pub store_loads: u64,
    pub refreshes: u64,
    pub backend_errors: u64,
}

impl ExpressionCacheMetrics {
    pub fn snapshot(&self) -> ExpressionCacheSnapshot {
        ExpressionCacheSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            store_loads: self.store_loads.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}

type RefreshResult = WarrantResult<Option<SubjectActionExpression>>;

/// Read-through expression cache.
///
/// # Type Parameters
///
/// - `S`: durable store holding aggregates and expressions
/// - `C`: cache backend
pub struct ExpressionCache<S, C>
where
    S: GrantSource + MaterializedStore + 'static,
    C: CacheBackend,
{
    store: Arc<S>,
    backend: Arc<C>,
    notifier: Option<Arc<dyn RefreshNotifier>>,
    config: CacheConfig,
    flights: SingleFlight<SubjectActionPair, RefreshResult>,
    metrics: ExpressionCacheMetrics,
}

impl<S, C> ExpressionCache<S, C>
where
    S: GrantSource + MaterializedStore + 'static,
    C: CacheBackend,
{
    pub fn new(store: Arc<S>, backend: Arc<C>, config: CacheConfig) -> Self {
        Self {
            store,
            backend,
            notifier: None,
            config,
            flights: SingleFlight::new(),
            metrics: ExpressionCacheMetrics::default(),
        }
    }

    /// Emit refresh notices through `notifier` when business expiry is hit.
    pub fn with_notifier(mut self, notifier: Arc<dyn RefreshNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &C {
        &self.backend
    }

    pub fn metrics(&self) -> &ExpressionCacheMetrics {
        &self.metrics
    }

    fn key(&self, (subject_pk, action_pk): SubjectActionPair) -> SubjectActionKey {
        SubjectActionKey::new(self.config.version.as_str(), subject_pk, action_pk)
    }

    /// Single-pair lookup.
    pub async fn get(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    ) -> WarrantResult<Option<SubjectActionExpression>> {
        let mut result = self.batch_get(&[(subject_pk, action_pk)]).await?;
        Ok(result.hits.pop())
    }

    /// Look up many pairs at once.
    pub async fn batch_get(&self, pairs: &[SubjectActionPair]) -> WarrantResult<BatchGetResult> {
        let keys: Vec<_> = pairs.iter().map(|pair| self.key(*pair)).collect();

        let cached = match self.backend.get_many(&keys).await {
            Ok(cached) => cached,
            Err(e) => {
                self.metrics.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, keys = keys.len(), "Cache read failed, falling back to store");
                HashMap::new()
            }
        };

        let mut found: HashMap<SubjectActionPair, SubjectActionExpression> = HashMap::new();
        let mut to_load = Vec::new();
        for key in &keys {
            match cached.get(key) {
                None => to_load.push(key.pair()),
                Some(value) if value.is_empty() => {
                    self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(value) => match serde_json::from_slice::<SubjectActionExpression>(value) {
                    Ok(expression) => {
                        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                        found.insert(key.pair(), expression);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, key = ?key.pair(), "Undecodable cache entry, reloading");
                        to_load.push(key.pair());
                    }
                },
            }
        }

        if !to_load.is_empty() {
            self.metrics
                .store_loads
                .fetch_add(to_load.len() as u64, Ordering::Relaxed);
            let loaded = self.store.expressions_list(&to_load).await?;
            let loaded: HashMap<_, _> = loaded
                .into_iter()
                .map(|e| ((e.subject_pk, e.action_pk), e))
                .collect();
            self.write_through(to_load.iter().map(|pair| (*pair, loaded.get(pair))))
                .await;
            found.extend(loaded);
        }

        let now = now_unix();
        let mut result = BatchGetResult::default();
        for pair in pairs {
            let valid = match found.get(pair) {
                None => None,
                Some(expression) if expression.is_empty() => None,
                Some(expression) if !expression.is_expired(now) => Some(expression.clone()),
                Some(_) => self
                    .refresh(*pair)
                    .await?
                    .filter(|expression| expression.is_valid(now)),
            };
            match valid {
                Some(expression) => result.hits.push(expression),
                None => result.misses.push(*pair),
            }
        }
        Ok(result)
    }

    /// Drop cached entries so the next read goes to the store.
    pub async fn invalidate(&self, pairs: &[SubjectActionPair]) -> WarrantResult<u64> {
        let keys: Vec<_> = pairs.iter().map(|pair| self.key(*pair)).collect();
        self.backend.delete_many(&keys).await
    }

    /// Re-derive an expired pair's expression, coalesced per pair.
    async fn refresh(&self, pair: SubjectActionPair) -> RefreshResult {
        self.flights
            .run(pair, || self.refresh_uncoalesced(pair))
            .await
    }

    async fn refresh_uncoalesced(&self, (subject_pk, action_pk): SubjectActionPair) -> RefreshResult {
        self.metrics.refreshes.fetch_add(1, Ordering::Relaxed);

        let expression = match self.store.aggregate_get(subject_pk, action_pk).await? {
            Some(aggregate) => materialize(self.store.as_ref(), &aggregate, now_unix()).await?,
            None => None,
        };

        self.write_through(std::iter::once((
            (subject_pk, action_pk),
            expression.as_ref(),
        )))
        .await;
        self.spawn_refresh_notice(subject_pk, action_pk);

        tracing::debug!(
            subject_pk,
            action_pk,
            has_expression = expression.is_some(),
            "Refreshed expired expression"
        );
        Ok(expression)
    }

    fn spawn_refresh_notice(&self, subject_pk: SubjectPk, action_pk: ActionPk) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_expired(subject_pk, action_pk).await {
                tracing::warn!(
                    error = %e,
                    subject_pk,
                    action_pk,
                    "Failed to emit refresh event"
                );
            }
        });
    }

    /// Best-effort write of store results; `None` stores the negative sentinel.
    async fn write_through<'a, I>(&self, rows: I)
    where
        I: IntoIterator<Item = (SubjectActionPair, Option<&'a SubjectActionExpression>)>,
    {
        let mut entries = Vec::new();
        for (pair, expression) in rows {
            let value = match expression {
                Some(expression) => match serde_json::to_vec(expression) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, key = ?pair, "Failed to encode expression for cache");
                        continue;
                    }
                },
                None => Vec::new(),
            };
            entries.push(CacheEntry {
                key: self.key(pair),
                value,
                ttl: self.config.jittered_ttl(),
            });
        }

        if entries.is_empty() {
            return;
        }
        if let Err(e) = self.backend.set_many(entries).await {
            self.metrics.backend_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Cache write failed");
        }
    }
}
