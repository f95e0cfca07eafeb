//! WARRANT Test Utilities
//!
//! Shared test infrastructure for the WARRANT workspace:
//! - Proptest generators for grant state and change events
//! - Fixtures seeding a [`MockStore`] with a small resource catalog
//! - Assertions over the error taxonomy

// Re-export mock storage from its source crate
pub use warrant_storage::MockStore;

// Re-export core types for convenience
pub use warrant_core::{
    now_unix, ActionPk, BatchStatus, Expression, GroupAlterEvent, GroupPk, ResourceMap,
    ResourceTypePk, SubjectActionAlterMessage, SubjectActionExpression, SubjectActionGroupMessage,
    SubjectActionGroupResource, SubjectPk, UnixSeconds, WarrantError, WarrantResult,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating WARRANT inputs.

    use super::*;
    use crate::fixtures::{HOST_TYPE, MODULE_TYPE, SET_TYPE};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// A group's membership and grant state for one (subject, action).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct GroupState {
        pub group_pk: GroupPk,
        /// Seconds from now the membership expires; `None` means not a member.
        pub membership_expires_in: Option<i64>,
        pub resources: ResourceMap,
    }

    /// Generate a resource instance id.
    pub fn arb_resource_id() -> impl Strategy<Value = String> {
        (1u32..500).prop_map(|n| n.to_string())
    }

    /// Generate grants over the fixture catalog's resource types.
    pub fn arb_resource_map() -> impl Strategy<Value = ResourceMap> {
        prop::collection::btree_map(
            prop_oneof![Just(HOST_TYPE), Just(MODULE_TYPE), Just(SET_TYPE)],
            prop::collection::vec(arb_resource_id(), 0..4),
            0..3,
        )
    }

    /// Generate a membership expiry offset: absent, already expired, or live.
    pub fn arb_membership_offset() -> impl Strategy<Value = Option<i64>> {
        prop_oneof![
            1 => Just(None),
            1 => (-7200i64..=-1).prop_map(Some),
            3 => (60i64..86_400).prop_map(Some),
        ]
    }

    /// Generate one group's state.
    pub fn arb_group_state(group_pk: GroupPk) -> impl Strategy<Value = GroupState> {
        (arb_membership_offset(), arb_resource_map()).prop_map(move |(offset, resources)| {
            GroupState {
                group_pk,
                membership_expires_in: offset,
                resources,
            }
        })
    }

    /// Generate state for groups `1..=max_groups`.
    pub fn arb_world(max_groups: GroupPk) -> impl Strategy<Value = Vec<GroupState>> {
        (1..=max_groups.max(1))
            .prop_flat_map(|n| (1..=n).map(arb_group_state).collect::<Vec<_>>())
    }

    /// Generate a change event over small PK ranges so events overlap.
    pub fn arb_change_event() -> impl Strategy<Value = GroupAlterEvent> {
        (
            1i64..4,
            prop::collection::vec(1i64..6, 1..4),
            prop::collection::vec(1i64..4, 1..3),
        )
            .prop_map(|(group_pk, subjects, actions)| {
                GroupAlterEvent::new(group_pk, subjects, actions, Utc::now())
            })
    }

    /// Generate a burst of change events landing in one transfer tick.
    pub fn arb_change_events() -> impl Strategy<Value = Vec<GroupAlterEvent>> {
        prop::collection::vec(arb_change_event(), 1..12)
    }

    /// Apply `world` to `store` for `(subject_pk, action_pk)`.
    pub fn seed_world(
        store: &MockStore,
        subject_pk: SubjectPk,
        action_pk: ActionPk,
        world: &[GroupState],
        now: UnixSeconds,
    ) {
        for group in world {
            match group.membership_expires_in {
                Some(offset) => store.add_membership(subject_pk, group.group_pk, now + offset),
                None => store.remove_membership(subject_pk, group.group_pk),
            }
            store.set_grant(group.group_pk, action_pk, group.resources.clone());
        }
    }

    /// Expected union of `(subject, action) -> groups` over events.
    pub fn expected_union(
        events: &[GroupAlterEvent],
    ) -> BTreeMap<(SubjectPk, ActionPk), Vec<GroupPk>> {
        let mut union: BTreeMap<(SubjectPk, ActionPk), Vec<GroupPk>> = BTreeMap::new();
        for (g, a, s) in events.iter().flat_map(|e| e.triples()) {
            union.entry((s, a)).or_default().push(g);
        }
        for groups in union.values_mut() {
            groups.sort_unstable();
            groups.dedup();
        }
        union
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use chrono::Utc;

    /// Resource type `host`.
    pub const HOST_TYPE: ResourceTypePk = 10;
    /// Resource type `module`.
    pub const MODULE_TYPE: ResourceTypePk = 11;
    /// Resource type `set`.
    pub const SET_TYPE: ResourceTypePk = 12;
    /// Action scoped to `host`.
    pub const VIEW_HOST: ActionPk = 3;
    /// Action scoped to `module`.
    pub const DEPLOY_MODULE: ActionPk = 4;

    /// Register the fixture catalog on an existing store.
    pub fn seed_catalog(store: &MockStore) {
        store.add_resource_type(HOST_TYPE, "host");
        store.add_resource_type(MODULE_TYPE, "module");
        store.add_resource_type(SET_TYPE, "set");
        store.add_action(VIEW_HOST, HOST_TYPE);
        store.add_action(DEPLOY_MODULE, MODULE_TYPE);
    }

    /// A fresh store with the fixture catalog.
    pub fn catalog_store() -> MockStore {
        let store = MockStore::new();
        seed_catalog(&store);
        store
    }

    /// Build a resource map from `(type, ids)` pairs.
    pub fn resources(entries: &[(ResourceTypePk, &[&str])]) -> ResourceMap {
        entries
            .iter()
            .map(|(rt, ids)| (*rt, ids.iter().map(|id| id.to_string()).collect()))
            .collect()
    }

    pub fn in_one_hour() -> UnixSeconds {
        now_unix() + 3600
    }

    pub fn an_hour_ago() -> UnixSeconds {
        now_unix() - 3600
    }

    pub fn entry(
        subject_pk: SubjectPk,
        action_pk: ActionPk,
        group_pks: &[GroupPk],
    ) -> SubjectActionGroupMessage {
        SubjectActionGroupMessage {
            subject_pk,
            action_pk,
            group_pks: group_pks.to_vec(),
        }
    }

    /// A pending batch holding `entries`.
    pub fn batch(entries: Vec<SubjectActionGroupMessage>) -> SubjectActionAlterMessage {
        SubjectActionAlterMessage::new(entries, Utc::now())
    }

    /// A change event old enough to clear any transfer safety margin.
    pub fn settled_event(
        group_pk: GroupPk,
        subject_pks: &[SubjectPk],
        action_pks: &[ActionPk],
    ) -> GroupAlterEvent {
        GroupAlterEvent::new(
            group_pk,
            subject_pks.iter().copied(),
            action_pks.iter().copied(),
            Utc::now() - chrono::Duration::minutes(5),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over WARRANT results.

    use super::*;

    /// Assert the result is the lock-contention "need retry" signal.
    pub fn assert_need_retry<T: std::fmt::Debug>(result: &WarrantResult<T>) {
        match result {
            Err(e) => assert!(e.is_need_retry(), "Expected need-retry, got: {:?}", e),
            Ok(v) => panic!("Expected need-retry error, got Ok({:?})", v),
        }
    }

    /// Assert the result failed on infrastructure.
    pub fn assert_transient<T: std::fmt::Debug>(result: &WarrantResult<T>) {
        match result {
            Err(e) => assert!(e.is_transient(), "Expected transient error, got: {:?}", e),
            Ok(v) => panic!("Expected transient error, got Ok({:?})", v),
        }
    }

    /// Assert the result is a validation error.
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &WarrantResult<T>) {
        assert!(
            matches!(result, Err(WarrantError::Validation(_))),
            "Expected validation error, got: {:?}",
            result
        );
    }

    /// Assert an expression is the single equality clause `field == value`.
    pub fn assert_eq_clause(expression: &SubjectActionExpression, field: &str, value: &str) {
        assert_eq!(
            expression.expression,
            Expression::Eq {
                field: field.to_string(),
                value: value.to_string(),
            }
        );
    }
}
