//! WARRANT Storage - Storage Traits and Implementations
//!
//! Defines the storage abstraction for the materialization pipeline, an
//! in-memory mock used by tests and single-process setups, the Postgres
//! store, lock and queue backends, and the read-through expression cache.

pub mod async_trait;
pub mod cache;
pub mod lock_backend;
pub mod materialize;
pub mod pg;
pub mod queue;

pub use async_trait::{
    BatchStore, ChangeEventStore, GrantSource, MaterializedStore, PipelineStore, RecomputeOutcome,
};
pub use cache::{
    BatchGetResult, CacheBackend, CacheConfig, CacheEntry, CacheStats, ExpressionCache,
    InMemoryCacheBackend, LmdbCacheBackend, RefreshNotifier, SubjectActionKey,
};
pub use lock_backend::{InMemoryLockBackend, LockBackend, LockKey};
pub use materialize::materialize;
pub use pg::{PgConfig, PgQueue, PgStore};
pub use queue::{Delivery, InMemoryQueue, WorkQueue};

use ::async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;
use warrant_core::{
    ActionPk, ActionScope, BatchStatus, GroupAlterEvent, GroupPk, ResourceMap, ResourceType,
    ResourceTypePk, StorageError, SubjectActionAlterMessage, SubjectActionExpression,
    SubjectActionGroupResource, SubjectActionPair, SubjectPk, Timestamp, UnixSeconds,
    WarrantResult,
};

// ============================================================================
// MOCK STORE
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    events: BTreeMap<Uuid, GroupAlterEvent>,
    batches: HashMap<Uuid, SubjectActionAlterMessage>,
    memberships: HashMap<(SubjectPk, GroupPk), UnixSeconds>,
    grants: HashMap<(GroupPk, ActionPk), ResourceMap>,
    actions: HashMap<ActionPk, ActionScope>,
    resource_types: HashMap<ResourceTypePk, ResourceType>,
    aggregates: HashMap<SubjectActionPair, SubjectActionGroupResource>,
    expressions: HashMap<SubjectActionPair, SubjectActionExpression>,
}

/// In-memory store implementing every pipeline trait.
///
/// Clones share state. `set_unavailable(true)` makes every trait call fail
/// with a pool error, for exercising retry paths.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    state: Arc<RwLock<MockState>>,
    unavailable: Arc<AtomicBool>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> WarrantResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Pool {
                reason: "mock store marked unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn read(&self) -> WarrantResult<RwLockReadGuard<'_, MockState>> {
        self.check_available()?;
        self.state.read().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> WarrantResult<RwLockWriteGuard<'_, MockState>> {
        self.check_available()?;
        self.state.write().map_err(|_| StorageError::LockPoisoned.into())
    }

    // === Seeding (collaborator tables) ===

    pub fn add_membership(&self, subject_pk: SubjectPk, group_pk: GroupPk, expires_at: UnixSeconds) {
        if let Ok(mut state) = self.state.write() {
            state.memberships.insert((subject_pk, group_pk), expires_at);
        }
    }

    pub fn remove_membership(&self, subject_pk: SubjectPk, group_pk: GroupPk) {
        if let Ok(mut state) = self.state.write() {
            state.memberships.remove(&(subject_pk, group_pk));
        }
    }

    pub fn set_grant(&self, group_pk: GroupPk, action_pk: ActionPk, resources: ResourceMap) {
        if let Ok(mut state) = self.state.write() {
            state.grants.insert((group_pk, action_pk), resources);
        }
    }

    pub fn remove_grant(&self, group_pk: GroupPk, action_pk: ActionPk) {
        if let Ok(mut state) = self.state.write() {
            state.grants.remove(&(group_pk, action_pk));
        }
    }

    pub fn add_action(&self, action_pk: ActionPk, resource_type_pk: ResourceTypePk) {
        if let Ok(mut state) = self.state.write() {
            state.actions.insert(
                action_pk,
                ActionScope {
                    action_pk,
                    resource_type_pk,
                },
            );
        }
    }

    pub fn remove_action(&self, action_pk: ActionPk) {
        if let Ok(mut state) = self.state.write() {
            state.actions.remove(&action_pk);
        }
    }

    pub fn add_resource_type(&self, pk: ResourceTypePk, id: impl Into<String>) {
        if let Ok(mut state) = self.state.write() {
            state.resource_types.insert(pk, ResourceType { pk, id: id.into() });
        }
    }

    // === Inspection ===

    pub fn events(&self) -> Vec<GroupAlterEvent> {
        self.state
            .read()
            .map(|s| s.events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn batches(&self) -> Vec<SubjectActionAlterMessage> {
        self.state
            .read()
            .map(|s| {
                let mut batches: Vec<_> = s.batches.values().cloned().collect();
                batches.sort_by_key(|b| b.uuid);
                batches
            })
            .unwrap_or_default()
    }

    pub fn aggregate(&self, pair: SubjectActionPair) -> Option<SubjectActionGroupResource> {
        self.state.read().ok()?.aggregates.get(&pair).cloned()
    }

    pub fn expression(&self, pair: SubjectActionPair) -> Option<SubjectActionExpression> {
        self.state.read().ok()?.expressions.get(&pair).cloned()
    }

    /// Overwrite a stored expression directly, bypassing the handler.
    pub fn put_expression(&self, expression: SubjectActionExpression) {
        if let Ok(mut state) = self.state.write() {
            state
                .expressions
                .insert((expression.subject_pk, expression.action_pk), expression);
        }
    }

    /// Overwrite a stored aggregate directly, bypassing the handler.
    pub fn put_aggregate(&self, aggregate: SubjectActionGroupResource) {
        if let Ok(mut state) = self.state.write() {
            state
                .aggregates
                .insert((aggregate.subject_pk, aggregate.action_pk), aggregate);
        }
    }

    /// Rewrite an event's creation time, for transfer safety-margin tests.
    pub fn backdate_event(&self, uuid: Uuid, created_at: Timestamp) {
        if let Ok(mut state) = self.state.write() {
            if let Some(event) = state.events.get_mut(&uuid) {
                event.created_at = created_at;
            }
        }
    }

    /// Rewrite a batch's `updated_at`, for checker tests.
    pub fn backdate_batch(&self, uuid: Uuid, updated_at: Timestamp) {
        if let Ok(mut state) = self.state.write() {
            if let Some(batch) = state.batches.get_mut(&uuid) {
                batch.updated_at = updated_at;
            }
        }
    }
}

#[async_trait]
impl ChangeEventStore for MockStore {
    async fn event_create_bulk(&self, events: &[GroupAlterEvent]) -> WarrantResult<()> {
        let mut state = self.write()?;
        for event in events {
            state.events.insert(event.uuid, event.clone());
        }
        Ok(())
    }

    async fn event_list_by_group(&self, group_pk: GroupPk) -> WarrantResult<Vec<GroupAlterEvent>> {
        let state = self.read()?;
        Ok(state
            .events
            .values()
            .filter(|e| e.group_pk == group_pk)
            .cloned()
            .collect())
    }

    async fn event_list_before(
        &self,
        created_before: Timestamp,
        limit: usize,
    ) -> WarrantResult<Vec<GroupAlterEvent>> {
        let state = self.read()?;
        let mut events: Vec<_> = state
            .events
            .values()
            .filter(|e| e.created_at <= created_before)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.uuid));
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl BatchStore for MockStore {
    async fn batch_commit_transfer(
        &self,
        batches: &[SubjectActionAlterMessage],
        consumed_events: &[Uuid],
    ) -> WarrantResult<()> {
        let mut state = self.write()?;
        for batch in batches {
            state.batches.insert(batch.uuid, batch.clone());
        }
        for uuid in consumed_events {
            state.events.remove(uuid);
        }
        Ok(())
    }

    async fn batch_get(&self, uuid: Uuid) -> WarrantResult<Option<SubjectActionAlterMessage>> {
        Ok(self.read()?.batches.get(&uuid).cloned())
    }

    async fn batch_begin_processing(
        &self,
        uuid: Uuid,
        now: Timestamp,
    ) -> WarrantResult<Option<SubjectActionAlterMessage>> {
        let mut state = self.write()?;
        Ok(state.batches.get_mut(&uuid).map(|batch| {
            batch.status = BatchStatus::Processing;
            batch.check_count += 1;
            batch.updated_at = now;
            batch.clone()
        }))
    }

    async fn batch_transition(
        &self,
        uuid: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: Timestamp,
    ) -> WarrantResult<bool> {
        let mut state = self.write()?;
        match state.batches.get_mut(&uuid) {
            Some(batch) if batch.status == from => {
                batch.status = to;
                batch.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn batch_delete(&self, uuid: Uuid) -> WarrantResult<()> {
        self.write()?.batches.remove(&uuid);
        Ok(())
    }

    async fn batch_list_stale(
        &self,
        updated_before: Timestamp,
        max_check_count: i64,
        limit: usize,
    ) -> WarrantResult<Vec<SubjectActionAlterMessage>> {
        let state = self.read()?;
        let mut stale: Vec<_> = state
            .batches
            .values()
            .filter(|b| b.updated_at < updated_before && b.check_count <= max_check_count)
            .cloned()
            .collect();
        stale.sort_by_key(|b| (b.updated_at, b.uuid));
        stale.truncate(limit);
        Ok(stale)
    }
}

#[async_trait]
impl GrantSource for MockStore {
    async fn membership_expires_at(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> WarrantResult<Option<UnixSeconds>> {
        Ok(self.read()?.memberships.get(&(subject_pk, group_pk)).copied())
    }

    async fn group_action_resources(
        &self,
        group_pk: GroupPk,
        action_pk: ActionPk,
    ) -> WarrantResult<ResourceMap> {
        Ok(self
            .read()?
            .grants
            .get(&(group_pk, action_pk))
            .cloned()
            .unwrap_or_default())
    }

    async fn action_scope(&self, action_pk: ActionPk) -> WarrantResult<Option<ActionScope>> {
        Ok(self.read()?.actions.get(&action_pk).copied())
    }

    async fn resource_types(&self, pks: &[ResourceTypePk]) -> WarrantResult<Vec<ResourceType>> {
        let state = self.read()?;
        Ok(pks
            .iter()
            .filter_map(|pk| state.resource_types.get(pk).cloned())
            .collect())
    }

    async fn group_member_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<SubjectPk>> {
        let now = Utc::now().timestamp();
        let state = self.read()?;
        let mut members: Vec<_> = state
            .memberships
            .iter()
            .filter(|((_, g), expires_at)| *g == group_pk && **expires_at > now)
            .map(|((s, _), _)| *s)
            .collect();
        members.sort_unstable();
        Ok(members)
    }

    async fn group_action_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<ActionPk>> {
        let state = self.read()?;
        let mut actions: Vec<_> = state
            .grants
            .keys()
            .filter(|(g, _)| *g == group_pk)
            .map(|(_, a)| *a)
            .collect();
        actions.sort_unstable();
        Ok(actions)
    }
}

#[async_trait]
impl MaterializedStore for MockStore {
    async fn aggregate_get(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    ) -> WarrantResult<Option<SubjectActionGroupResource>> {
        Ok(self.read()?.aggregates.get(&(subject_pk, action_pk)).cloned())
    }

    async fn expressions_list(
        &self,
        pairs: &[SubjectActionPair],
    ) -> WarrantResult<Vec<SubjectActionExpression>> {
        let state = self.read()?;
        Ok(pairs
            .iter()
            .filter_map(|pair| state.expressions.get(pair).cloned())
            .collect())
    }

    async fn materialized_apply(&self, outcome: &RecomputeOutcome) -> WarrantResult<()> {
        let mut state = self.write()?;
        let pair = outcome.pair();
        match outcome {
            RecomputeOutcome::Persist {
                aggregate,
                expression,
            } => {
                state.aggregates.insert(pair, aggregate.clone());
                match expression {
                    Some(expression) => {
                        state.expressions.insert(pair, expression.clone());
                    }
                    None => {
                        state.expressions.remove(&pair);
                    }
                }
            }
            RecomputeOutcome::Delete { .. } => {
                state.aggregates.remove(&pair);
                state.expressions.remove(&pair);
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use warrant_core::SubjectActionGroupMessage;

    #[tokio::test]
    async fn test_commit_transfer_is_all_or_nothing_view() {
        let store = MockStore::new();
        let event = GroupAlterEvent::new(1, [7], [3], Utc::now());
        store.event_create_bulk(&[event.clone()]).await.unwrap();

        let batch = SubjectActionAlterMessage::new(
            vec![SubjectActionGroupMessage {
                subject_pk: 7,
                action_pk: 3,
                group_pks: vec![1],
            }],
            Utc::now(),
        );
        store
            .batch_commit_transfer(&[batch.clone()], &[event.uuid])
            .await
            .unwrap();

        assert!(store.events().is_empty());
        assert_eq!(store.batches(), vec![batch]);
    }

    #[tokio::test]
    async fn test_event_list_before_respects_margin_and_limit() {
        let store = MockStore::new();
        let now = Utc::now();
        let old_a = GroupAlterEvent::new(1, [1], [1], now - Duration::seconds(90));
        let old_b = GroupAlterEvent::new(2, [1], [1], now - Duration::seconds(60));
        let fresh = GroupAlterEvent::new(3, [1], [1], now);
        store
            .event_create_bulk(&[old_a.clone(), old_b.clone(), fresh])
            .await
            .unwrap();

        let listed = store
            .event_list_before(now - Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(listed, vec![old_a.clone(), old_b]);

        let limited = store
            .event_list_before(now - Duration::seconds(30), 1)
            .await
            .unwrap();
        assert_eq!(limited, vec![old_a]);
    }

    #[tokio::test]
    async fn test_begin_processing_increments_check_count() {
        let store = MockStore::new();
        let batch = SubjectActionAlterMessage::new(Vec::new(), Utc::now());
        store.batch_commit_transfer(&[batch.clone()], &[]).await.unwrap();

        let first = store
            .batch_begin_processing(batch.uuid, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.check_count, 1);
        assert_eq!(first.status, BatchStatus::Processing);

        let missing = store
            .batch_begin_processing(Uuid::now_v7(), Utc::now())
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_transition_only_from_expected_status() {
        let store = MockStore::new();
        let batch = SubjectActionAlterMessage::new(Vec::new(), Utc::now());
        store.batch_commit_transfer(&[batch.clone()], &[]).await.unwrap();
        store.batch_begin_processing(batch.uuid, Utc::now()).await.unwrap();

        let moved = store
            .batch_transition(batch.uuid, BatchStatus::Pending, BatchStatus::Pushed, Utc::now())
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(store.batches()[0].status, BatchStatus::Processing);
    }

    #[tokio::test]
    async fn test_apply_delete_removes_both_rows() {
        let store = MockStore::new();
        let mut aggregate = SubjectActionGroupResource::new(7, 3);
        aggregate.upsert_group(1, i64::MAX, ResourceMap::from([(10, vec!["a".to_string()])]));
        store.put_aggregate(aggregate);
        store.put_expression(SubjectActionExpression {
            subject_pk: 7,
            action_pk: 3,
            expression: warrant_core::Expression::Eq {
                field: "host.id".to_string(),
                value: "a".to_string(),
            },
            expires_at: i64::MAX,
        });

        store
            .materialized_apply(&RecomputeOutcome::Delete {
                subject_pk: 7,
                action_pk: 3,
            })
            .await
            .unwrap();

        assert!(store.aggregate((7, 3)).is_none());
        assert!(store.expression((7, 3)).is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = MockStore::new();
        store.set_unavailable(true);
        let err = store.batch_get(Uuid::now_v7()).await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(store.batch_get(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_member_pks_excludes_expired() {
        let store = MockStore::new();
        let now = Utc::now().timestamp();
        store.add_membership(1, 9, now + 3600);
        store.add_membership(2, 9, now - 1);
        store.add_membership(3, 8, now + 3600);

        assert_eq!(store.group_member_pks(9).await.unwrap(), vec![1]);
    }
}
