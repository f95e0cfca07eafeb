//! Aggregate grant state per (subject, action).
//!
//! The aggregate is the owned materialized state the expression is derived
//! from. Maps are ordered so that serializing the same state twice yields
//! the same bytes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{ActionPk, GroupPk, ResourceTypePk, SubjectPk, UnixSeconds};

/// Resource instances per resource type.
pub type ResourceMap = BTreeMap<ResourceTypePk, Vec<String>>;

/// A subject's time-bounded membership in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub subject_pk: SubjectPk,
    pub group_pk: GroupPk,
    pub expires_at: UnixSeconds,
}

impl Membership {
    /// A membership with `expires_at <= now` must not contribute grants.
    pub fn is_active(&self, now: UnixSeconds) -> bool {
        self.expires_at > now
    }
}

/// The resource type an action is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionScope {
    pub action_pk: ActionPk,
    pub resource_type_pk: ResourceTypePk,
}

/// A resource type and the string id used in expression field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    pub pk: ResourceTypePk,
    pub id: String,
}

/// One group's contribution to an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResource {
    pub expires_at: UnixSeconds,
    pub resources: ResourceMap,
}

impl GroupResource {
    pub fn new(expires_at: UnixSeconds, resources: ResourceMap) -> Self {
        Self {
            expires_at,
            resources: normalize(resources),
        }
    }

    pub fn is_live(&self, now: UnixSeconds) -> bool {
        self.expires_at > now
    }
}

/// Per-(subject, action) map of group PK to that group's grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectActionGroupResource {
    pub subject_pk: SubjectPk,
    pub action_pk: ActionPk,
    pub group_resource: BTreeMap<GroupPk, GroupResource>,
}

impl SubjectActionGroupResource {
    /// An empty aggregate for the pair.
    pub fn new(subject_pk: SubjectPk, action_pk: ActionPk) -> Self {
        Self {
            subject_pk,
            action_pk,
            group_resource: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.group_resource.is_empty()
    }

    /// Insert or replace a group's entry.
    pub fn upsert_group(&mut self, group_pk: GroupPk, expires_at: UnixSeconds, resources: ResourceMap) {
        self.group_resource
            .insert(group_pk, GroupResource::new(expires_at, resources));
    }

    /// Remove a group's entry entirely. Returns whether it existed.
    pub fn remove_group(&mut self, group_pk: GroupPk) -> bool {
        self.group_resource.remove(&group_pk).is_some()
    }

    /// Resource types referenced by any entry.
    pub fn resource_type_pks(&self) -> BTreeSet<ResourceTypePk> {
        self.group_resource
            .values()
            .flat_map(|g| g.resources.keys().copied())
            .collect()
    }

    /// Minimum expiry over entries still live at `now`, if any.
    pub fn min_live_expires_at(&self, now: UnixSeconds) -> Option<UnixSeconds> {
        self.group_resource
            .values()
            .filter(|g| g.is_live(now))
            .map(|g| g.expires_at)
            .min()
    }
}

/// Sort and dedup every id list, dropping types with no ids.
fn normalize(resources: ResourceMap) -> ResourceMap {
    resources
        .into_iter()
        .filter_map(|(rt, mut ids)| {
            ids.sort();
            ids.dedup();
            if ids.is_empty() {
                None
            } else {
                Some((rt, ids))
            }
        })
        .collect()
}
