//! Change Producer
//!
//! Turns "group G's membership or grants changed" into change events.
//! Before writing, every `(group, action, subject)` triple already covered by
//! a not-yet-transferred event for the same group is dropped, so a group
//! that changes repeatedly between transfer ticks does not fan out
//! duplicate work.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use warrant_core::constants::{DEFAULT_EVENT_SHARD_SIZE, REFRESH_GROUP_PK};
use warrant_core::{ActionPk, GroupAlterEvent, GroupPk, SubjectPk, WarrantResult};
use warrant_storage::{PipelineStore, RefreshNotifier};

use crate::metrics;

/// Configuration for the change producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Maximum subjects carried by one event.
    pub shard_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            shard_size: DEFAULT_EVENT_SHARD_SIZE,
        }
    }
}

impl ProducerConfig {
    /// Reads `WARRANT_EVENT_SHARD_SIZE` (default: 100).
    pub fn from_env() -> Self {
        Self {
            shard_size: std::env::var("WARRANT_EVENT_SHARD_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_EVENT_SHARD_SIZE),
        }
    }
}

/// Writes deduplicated change events.
pub struct ChangeProducer<S: PipelineStore> {
    store: Arc<S>,
    config: ProducerConfig,
}

impl<S: PipelineStore> ChangeProducer<S> {
    pub fn new(store: Arc<S>, config: ProducerConfig) -> Self {
        Self { store, config }
    }

    /// Publish a change for `group_pk` affecting `subject_pks` x `action_pks`.
    ///
    /// Returns the number of events written (zero when every triple is
    /// already pending). A store failure is logged and returned; the caller
    /// decides whether to retry.
    pub async fn publish(
        &self,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
        action_pks: &[ActionPk],
    ) -> WarrantResult<usize> {
        self.publish_as("publish", group_pk, subject_pks, action_pks)
            .await
    }

    /// Membership of `group_pk` changed for `subject_pks`; affects every
    /// action the group currently holds grants for.
    pub async fn publish_members_changed(
        &self,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
    ) -> WarrantResult<usize> {
        let action_pks = self.store.group_action_pks(group_pk).await?;
        self.publish_as("members", group_pk, subject_pks, &action_pks)
            .await
    }

    /// Grants of `group_pk` changed for `action_pks`; affects the group's
    /// current members.
    pub async fn publish_grants_changed(
        &self,
        group_pk: GroupPk,
        action_pks: &[ActionPk],
    ) -> WarrantResult<usize> {
        let subject_pks = self.store.group_member_pks(group_pk).await?;
        self.publish_as("grants", group_pk, &subject_pks, action_pks)
            .await
    }

    /// Ask the pipeline to re-synthesize a pair from its stored aggregate.
    pub async fn publish_refresh(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    ) -> WarrantResult<usize> {
        self.publish_as("refresh", REFRESH_GROUP_PK, &[subject_pk], &[action_pk])
            .await
    }

    async fn publish_as(
        &self,
        kind: &str,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
        action_pks: &[ActionPk],
    ) -> WarrantResult<usize> {
        if subject_pks.is_empty() || action_pks.is_empty() {
            return Ok(0);
        }

        let result = self.write_events(group_pk, subject_pks, action_pks).await;
        match &result {
            Ok(0) => {
                tracing::debug!(group_pk, kind, "All change triples already pending");
            }
            Ok(written) => {
                metrics::record_events_published(kind, *written);
                tracing::debug!(group_pk, kind, events = written, "Published change events");
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    group_pk,
                    kind,
                    subjects = subject_pks.len(),
                    actions = action_pks.len(),
                    "Failed to publish change event"
                );
            }
        }
        result
    }

    async fn write_events(
        &self,
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
        action_pks: &[ActionPk],
    ) -> WarrantResult<usize> {
        let pending = self.store.event_list_by_group(group_pk).await?;
        let events = build_events(
            group_pk,
            subject_pks,
            action_pks,
            &pending,
            self.config.shard_size,
        );
        if events.is_empty() {
            return Ok(0);
        }
        self.store.event_create_bulk(&events).await?;
        Ok(events.len())
    }
}

#[async_trait]
impl<S: PipelineStore> RefreshNotifier for ChangeProducer<S> {
    async fn notify_expired(&self, subject_pk: SubjectPk, action_pk: ActionPk) -> WarrantResult<()> {
        self.publish_refresh(subject_pk, action_pk).await.map(|_| ())
    }
}

/// Drop triples covered by `pending`, then regroup the rest into events.
///
/// Actions whose surviving subject sets are identical share an event;
/// subject lists longer than `shard_size` are split across events.
pub fn build_events(
    group_pk: GroupPk,
    subject_pks: &[SubjectPk],
    action_pks: &[ActionPk],
    pending: &[GroupAlterEvent],
    shard_size: usize,
) -> Vec<GroupAlterEvent> {
    let covered: HashSet<(ActionPk, SubjectPk)> = pending
        .iter()
        .filter(|e| e.group_pk == group_pk)
        .flat_map(|e| e.triples().map(|(_, a, s)| (a, s)))
        .collect();

    let subjects: BTreeSet<SubjectPk> = subject_pks.iter().copied().collect();
    let actions: BTreeSet<ActionPk> = action_pks.iter().copied().collect();

    let mut by_subject_set: BTreeMap<Vec<SubjectPk>, Vec<ActionPk>> = BTreeMap::new();
    for action_pk in actions {
        let remaining: Vec<SubjectPk> = subjects
            .iter()
            .copied()
            .filter(|s| !covered.contains(&(action_pk, *s)))
            .collect();
        if !remaining.is_empty() {
            by_subject_set.entry(remaining).or_default().push(action_pk);
        }
    }

    let now = Utc::now();
    let shard_size = shard_size.max(1);
    by_subject_set
        .into_iter()
        .flat_map(|(subjects, actions)| {
            subjects
                .chunks(shard_size)
                .map(|shard| GroupAlterEvent::new(group_pk, shard.to_vec(), actions.clone(), now))
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use warrant_storage::MockStore;

    fn triples(events: &[GroupAlterEvent]) -> BTreeSet<(GroupPk, ActionPk, SubjectPk)> {
        events.iter().flat_map(|e| e.triples()).collect()
    }

    #[test]
    fn test_build_events_drops_pending_triples() {
        let pending = vec![GroupAlterEvent::new(1, [1, 2], [10], Utc::now())];
        let events = build_events(1, &[1, 2, 3], &[10, 11], &pending, 100);

        let expected: BTreeSet<_> = [(1, 10, 3), (1, 11, 1), (1, 11, 2), (1, 11, 3)]
            .into_iter()
            .collect();
        assert_eq!(triples(&events), expected);
    }

    #[test]
    fn test_build_events_groups_actions_with_same_subjects() {
        let events = build_events(1, &[1, 2], &[10, 11, 12], &[], 100);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_pks, vec![10, 11, 12]);
        assert_eq!(events[0].subject_pks, vec![1, 2]);
    }

    #[test]
    fn test_build_events_shards_subjects() {
        let subjects: Vec<_> = (1..=5).collect();
        let events = build_events(1, &subjects, &[10], &[], 2);
        let sizes: Vec<_> = events.iter().map(|e| e.subject_pks.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(triples(&events).len(), 5);
    }

    #[test]
    fn test_build_events_ignores_other_groups() {
        let pending = vec![GroupAlterEvent::new(2, [1], [10], Utc::now())];
        let events = build_events(1, &[1], &[10], &pending, 100);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_publish_is_suppressed() {
        let store = Arc::new(MockStore::new());
        let producer = ChangeProducer::new(store.clone(), ProducerConfig::default());

        assert_eq!(producer.publish(1, &[1, 2], &[10]).await.unwrap(), 1);
        assert_eq!(producer.publish(1, &[1, 2], &[10]).await.unwrap(), 0);
        assert_eq!(producer.publish(1, &[2, 3], &[10]).await.unwrap(), 1);

        let all = triples(&store.events());
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_members_changed_uses_group_actions() {
        let store = Arc::new(MockStore::new());
        store.set_grant(1, 10, Default::default());
        store.set_grant(1, 11, Default::default());
        let producer = ChangeProducer::new(store.clone(), ProducerConfig::default());

        producer.publish_members_changed(1, &[7]).await.unwrap();
        let expected: BTreeSet<_> = [(1, 10, 7), (1, 11, 7)].into_iter().collect();
        assert_eq!(triples(&store.events()), expected);
    }

    #[tokio::test]
    async fn test_grants_changed_uses_active_members() {
        let store = Arc::new(MockStore::new());
        let now = Utc::now().timestamp();
        store.add_membership(7, 1, now + 3600);
        store.add_membership(8, 1, now - 1);
        let producer = ChangeProducer::new(store.clone(), ProducerConfig::default());

        producer.publish_grants_changed(1, &[10]).await.unwrap();
        let expected: BTreeSet<_> = [(1, 10, 7)].into_iter().collect();
        assert_eq!(triples(&store.events()), expected);
    }

    #[tokio::test]
    async fn test_refresh_uses_reserved_group() {
        let store = Arc::new(MockStore::new());
        let producer = ChangeProducer::new(store.clone(), ProducerConfig::default());

        producer.notify_expired(7, 3).await.unwrap();
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].group_pk, REFRESH_GROUP_PK);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let store = Arc::new(MockStore::new());
        store.set_unavailable(true);
        let producer = ChangeProducer::new(store, ProducerConfig::default());
        assert!(producer.publish(1, &[1], &[1]).await.is_err());
    }
}
