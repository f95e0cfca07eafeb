//! Async storage traits for the materialization pipeline.
//!
//! The pipeline touches four kinds of durable state, each behind its own
//! trait so components only see what they use:
//!
//! - [`ChangeEventStore`]: append-only change events (producer, transfer)
//! - [`BatchStore`]: recompute batches (transfer, handler, checker)
//! - [`GrantSource`]: membership and grant tables owned elsewhere (read-only)
//! - [`MaterializedStore`]: aggregate and expression rows (handler, cache)

use ::async_trait::async_trait;
use uuid::Uuid;
use warrant_core::{
    ActionPk, ActionScope, BatchStatus, GroupAlterEvent, GroupPk, ResourceMap, ResourceType,
    ResourceTypePk, SubjectActionAlterMessage, SubjectActionExpression, SubjectActionGroupResource,
    SubjectActionPair, SubjectPk, Timestamp, UnixSeconds, WarrantResult,
};

/// Writes produced by one locked recompute. Applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// Aggregate still has entries. An absent expression removes the
    /// expression row while keeping the aggregate.
    Persist {
        aggregate: SubjectActionGroupResource,
        expression: Option<SubjectActionExpression>,
    },
    /// Aggregate became empty: delete both rows.
    Delete {
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    },
}

impl RecomputeOutcome {
    pub fn pair(&self) -> SubjectActionPair {
        match self {
            RecomputeOutcome::Persist { aggregate, .. } => (aggregate.subject_pk, aggregate.action_pk),
            RecomputeOutcome::Delete {
                subject_pk,
                action_pk,
            } => (*subject_pk, *action_pk),
        }
    }
}

#[async_trait]
pub trait ChangeEventStore: Send + Sync {
    /// Append change events.
    async fn event_create_bulk(&self, events: &[GroupAlterEvent]) -> WarrantResult<()>;

    /// Events for a group not yet merged into a batch.
    async fn event_list_by_group(&self, group_pk: GroupPk) -> WarrantResult<Vec<GroupAlterEvent>>;

    /// Oldest events created before `created_before`, at most `limit`.
    async fn event_list_before(
        &self,
        created_before: Timestamp,
        limit: usize,
    ) -> WarrantResult<Vec<GroupAlterEvent>>;
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert `batches` and delete the consumed events in one transaction.
    async fn batch_commit_transfer(
        &self,
        batches: &[SubjectActionAlterMessage],
        consumed_events: &[Uuid],
    ) -> WarrantResult<()>;

    async fn batch_get(&self, uuid: Uuid) -> WarrantResult<Option<SubjectActionAlterMessage>>;

    /// Mark processing and increment `check_count`, returning the updated
    /// record, or `None` if the batch no longer exists.
    async fn batch_begin_processing(
        &self,
        uuid: Uuid,
        now: Timestamp,
    ) -> WarrantResult<Option<SubjectActionAlterMessage>>;

    /// Move `from` to `to`. Returns false if the batch was not in `from`.
    async fn batch_transition(
        &self,
        uuid: Uuid,
        from: BatchStatus,
        to: BatchStatus,
        now: Timestamp,
    ) -> WarrantResult<bool>;

    async fn batch_delete(&self, uuid: Uuid) -> WarrantResult<()>;

    /// Batches untouched since `updated_before` that may still be retried.
    async fn batch_list_stale(
        &self,
        updated_before: Timestamp,
        max_check_count: i64,
        limit: usize,
    ) -> WarrantResult<Vec<SubjectActionAlterMessage>>;
}

#[async_trait]
pub trait GrantSource: Send + Sync {
    /// Membership expiry of a subject in a group, if a membership row exists.
    async fn membership_expires_at(
        &self,
        subject_pk: SubjectPk,
        group_pk: GroupPk,
    ) -> WarrantResult<Option<UnixSeconds>>;

    /// Resources the group is authorized for on this action. Empty if none.
    async fn group_action_resources(
        &self,
        group_pk: GroupPk,
        action_pk: ActionPk,
    ) -> WarrantResult<ResourceMap>;

    async fn action_scope(&self, action_pk: ActionPk) -> WarrantResult<Option<ActionScope>>;

    /// Known resource types among `pks`; unknown pks are simply absent.
    async fn resource_types(&self, pks: &[ResourceTypePk]) -> WarrantResult<Vec<ResourceType>>;

    /// Current members of a group.
    async fn group_member_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<SubjectPk>>;

    /// Actions the group currently holds grants for.
    async fn group_action_pks(&self, group_pk: GroupPk) -> WarrantResult<Vec<ActionPk>>;
}

#[async_trait]
pub trait MaterializedStore: Send + Sync {
    async fn aggregate_get(
        &self,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
    ) -> WarrantResult<Option<SubjectActionGroupResource>>;

    /// Stored expressions for the pairs that have one.
    async fn expressions_list(
        &self,
        pairs: &[SubjectActionPair],
    ) -> WarrantResult<Vec<SubjectActionExpression>>;

    /// Apply one recompute's writes in a single transaction.
    async fn materialized_apply(&self, outcome: &RecomputeOutcome) -> WarrantResult<()>;
}

/// Everything the pipeline needs from one durable store.
pub trait PipelineStore:
    ChangeEventStore + BatchStore + GrantSource + MaterializedStore + 'static
{
}

impl<T> PipelineStore for T where
    T: ChangeEventStore + BatchStore + GrantSource + MaterializedStore + 'static
{
}
