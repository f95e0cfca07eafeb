//! Materialized expressions and the synthesizer.
//!
//! The synthesizer flattens an aggregate into the boolean-expression shape
//! consumed by the policy evaluator:
//!
//! - ids of the action's own resource type become `eq` (one id) or `in`
//! - ids of any other type become a `string_contains` over the path field
//!   with `/<type>,<id>/` fragments
//! - several clauses are wrapped in `OR`, sorted by field name

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::aggregate::{ActionScope, ResourceType, SubjectActionGroupResource};
use crate::{ActionPk, ResourceTypePk, SubjectPk, UnixSeconds};

/// Boolean expression wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Expression {
    #[serde(rename = "eq")]
    Eq { field: String, value: String },

    #[serde(rename = "in")]
    In { field: String, value: Vec<String> },

    #[serde(rename = "string_contains")]
    StringContains { field: String, value: Vec<String> },

    #[serde(rename = "OR")]
    Or { content: Vec<Expression> },
}

impl Expression {
    /// Field the clause tests; `OR` has none.
    pub fn field(&self) -> Option<&str> {
        match self {
            Expression::Eq { field, .. }
            | Expression::In { field, .. }
            | Expression::StringContains { field, .. } => Some(field),
            Expression::Or { .. } => None,
        }
    }

    /// Canonical JSON encoding.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Derived state per (subject, action).
///
/// `expires_at == 0` means the pair has no valid expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectActionExpression {
    pub subject_pk: SubjectPk,
    pub action_pk: ActionPk,
    pub expression: Expression,
    pub expires_at: UnixSeconds,
}

impl SubjectActionExpression {
    pub fn is_empty(&self) -> bool {
        self.expires_at == 0
    }

    /// Business expiry, distinct from any cache TTL.
    pub fn is_expired(&self, now: UnixSeconds) -> bool {
        self.expires_at <= now
    }

    /// Valid for the decision path at `now`.
    pub fn is_valid(&self, now: UnixSeconds) -> bool {
        !self.is_empty() && !self.is_expired(now)
    }
}

/// Synthesize the expression for an aggregate.
///
/// Entries expired at `now` do not contribute. `resource_types` must hold
/// every type referenced by the aggregate plus the action's own type;
/// clauses for unknown types are dropped. Returns `None` when nothing
/// contributes.
pub fn synthesize(
    aggregate: &SubjectActionGroupResource,
    scope: &ActionScope,
    resource_types: &BTreeMap<ResourceTypePk, ResourceType>,
    now: UnixSeconds,
) -> Option<SubjectActionExpression> {
    let primary = resource_types.get(&scope.resource_type_pk)?;
    let expires_at = aggregate.min_live_expires_at(now)?;

    let mut merged: BTreeMap<ResourceTypePk, BTreeSet<&str>> = BTreeMap::new();
    for entry in aggregate.group_resource.values().filter(|g| g.is_live(now)) {
        for (rt, ids) in &entry.resources {
            merged
                .entry(*rt)
                .or_default()
                .extend(ids.iter().map(String::as_str));
        }
    }

    let mut clauses: Vec<Expression> = Vec::with_capacity(merged.len());
    for (rt, ids) in merged {
        if ids.is_empty() {
            continue;
        }
        if rt == scope.resource_type_pk {
            let field = format!("{}.id", primary.id);
            let mut ids: Vec<String> = ids.into_iter().map(str::to_string).collect();
            let clause = if ids.len() == 1 {
                Expression::Eq {
                    field,
                    value: ids.remove(0),
                }
            } else {
                Expression::In { field, value: ids }
            };
            clauses.push(clause);
        } else if let Some(other) = resource_types.get(&rt) {
            clauses.push(Expression::StringContains {
                field: format!("{}._path_", primary.id),
                value: ids
                    .into_iter()
                    .map(|id| format!("/{},{}/", other.id, id))
                    .collect(),
            });
        }
    }

    // Several path clauses share a field; the serialized form breaks ties.
    clauses.sort_by_cached_key(|c| {
        (
            c.field().unwrap_or_default().to_string(),
            c.to_json().unwrap_or_default(),
        )
    });

    let expression = match clauses.len() {
        0 => return None,
        1 => clauses.remove(0),
        _ => Expression::Or { content: clauses },
    };

    Some(SubjectActionExpression {
        subject_pk: aggregate.subject_pk,
        action_pk: aggregate.action_pk,
        expression,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ResourceMap;
    use proptest::prelude::*;

    const HOST: ResourceTypePk = 10;
    const BIZ: ResourceTypePk = 11;
    const MODULE: ResourceTypePk = 12;
    const NOW: UnixSeconds = 1_700_000_000;

    fn types() -> BTreeMap<ResourceTypePk, ResourceType> {
        [(HOST, "host"), (BIZ, "biz"), (MODULE, "module")]
            .into_iter()
            .map(|(pk, id)| {
                (
                    pk,
                    ResourceType {
                        pk,
                        id: id.to_string(),
                    },
                )
            })
            .collect()
    }

    fn scope() -> ActionScope {
        ActionScope {
            action_pk: 3,
            resource_type_pk: HOST,
        }
    }

    fn grants(entries: &[(ResourceTypePk, &[&str])]) -> ResourceMap {
        entries
            .iter()
            .map(|(rt, ids)| (*rt, ids.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_single_id_is_plain_equality() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(1, NOW + 3600, grants(&[(HOST, &["100"])]));

        let expr = synthesize(&agg, &scope(), &types(), NOW).unwrap();
        assert_eq!(expr.expires_at, NOW + 3600);
        assert_eq!(
            expr.expression.to_json().unwrap(),
            r#"{"op":"eq","field":"host.id","value":"100"}"#
        );
    }

    #[test]
    fn test_ids_union_across_groups_into_membership_test() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(1, NOW + 3600, grants(&[(HOST, &["200", "100"])]));
        agg.upsert_group(2, NOW + 60, grants(&[(HOST, &["100", "300"])]));

        let expr = synthesize(&agg, &scope(), &types(), NOW).unwrap();
        assert_eq!(expr.expires_at, NOW + 60);
        assert_eq!(
            expr.expression,
            Expression::In {
                field: "host.id".to_string(),
                value: vec!["100".to_string(), "200".to_string(), "300".to_string()],
            }
        );
    }

    #[test]
    fn test_other_types_become_path_clauses_under_or() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(
            1,
            NOW + 3600,
            grants(&[(HOST, &["100"]), (BIZ, &["b1"]), (MODULE, &["m1", "m2"])]),
        );

        let expr = synthesize(&agg, &scope(), &types(), NOW).unwrap();
        let Expression::Or { content } = &expr.expression else {
            panic!("expected OR, got {:?}", expr.expression);
        };
        assert_eq!(content.len(), 3);
        assert_eq!(content[0].field(), Some("host._path_"));
        assert_eq!(content[1].field(), Some("host._path_"));
        assert_eq!(content[2].field(), Some("host.id"));
        assert_eq!(
            content[0],
            Expression::StringContains {
                field: "host._path_".to_string(),
                value: vec!["/biz,b1/".to_string()],
            }
        );
    }

    #[test]
    fn test_expired_entries_do_not_contribute() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(1, NOW + 3600, grants(&[(HOST, &["100"])]));
        agg.upsert_group(2, NOW - 1, grants(&[(HOST, &["999"])]));

        let expr = synthesize(&agg, &scope(), &types(), NOW).unwrap();
        assert_eq!(
            expr.expression,
            Expression::Eq {
                field: "host.id".to_string(),
                value: "100".to_string(),
            }
        );
        assert_eq!(expr.expires_at, NOW + 3600);
    }

    #[test]
    fn test_nothing_live_yields_none() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(2, NOW, grants(&[(HOST, &["999"])]));
        assert!(synthesize(&agg, &scope(), &types(), NOW).is_none());
        assert!(synthesize(&SubjectActionGroupResource::new(7, 3), &scope(), &types(), NOW).is_none());
    }

    #[test]
    fn test_unknown_types_are_dropped() {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        agg.upsert_group(1, NOW + 10, grants(&[(99, &["x"])]));
        assert!(synthesize(&agg, &scope(), &types(), NOW).is_none());

        let missing_scope = ActionScope {
            action_pk: 3,
            resource_type_pk: 98,
        };
        agg.upsert_group(2, NOW + 10, grants(&[(HOST, &["1"])]));
        assert!(synthesize(&agg, &missing_scope, &types(), NOW).is_none());
    }

    #[test]
    fn test_or_wire_shape() {
        let expr = Expression::Or {
            content: vec![Expression::Eq {
                field: "host.id".to_string(),
                value: "1".to_string(),
            }],
        };
        let json: serde_json::Value = serde_json::from_str(&expr.to_json().unwrap()).unwrap();
        assert_eq!(json["op"], "OR");
        assert_eq!(json["content"][0]["op"], "eq");
    }

    fn arb_grants() -> impl Strategy<Value = Vec<(i64, i64, Vec<(ResourceTypePk, Vec<String>)>)>> {
        prop::collection::vec(
            (
                1i64..20,
                -100i64..10_000,
                prop::collection::vec(
                    (
                        prop::sample::select(vec![HOST, BIZ, MODULE]),
                        prop::collection::vec("[a-c][0-9]", 1..4),
                    ),
                    1..3,
                ),
            ),
            0..8,
        )
    }

    fn build(
        entries: &[(i64, i64, Vec<(ResourceTypePk, Vec<String>)>)],
        reverse: bool,
    ) -> SubjectActionGroupResource {
        let mut agg = SubjectActionGroupResource::new(7, 3);
        let iter: Box<dyn Iterator<Item = _>> = if reverse {
            Box::new(entries.iter().rev())
        } else {
            Box::new(entries.iter())
        };
        for (group, offset, res) in iter {
            let mut map = ResourceMap::new();
            for (rt, ids) in res {
                let mut ids = ids.clone();
                if reverse {
                    ids.reverse();
                }
                map.entry(*rt).or_insert_with(Vec::new).extend(ids);
            }
            agg.upsert_group(*group, NOW + offset, map);
        }
        agg
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_synthesis_is_order_independent(entries in arb_grants()) {
            // Dedup group keys so both builds keep the same entry per group.
            let mut seen = BTreeSet::new();
            let entries: Vec<_> = entries.into_iter().filter(|(g, _, _)| seen.insert(*g)).collect();

            let a = synthesize(&build(&entries, false), &scope(), &types(), NOW);
            let b = synthesize(&build(&entries, true), &scope(), &types(), NOW);
            prop_assert_eq!(
                a.as_ref().map(|e| e.expression.to_json().unwrap()),
                b.as_ref().map(|e| e.expression.to_json().unwrap())
            );
        }

        #[test]
        fn prop_expires_at_is_min_of_live_entries(entries in arb_grants()) {
            let agg = build(&entries, false);
            let expected = agg
                .group_resource
                .values()
                .filter(|g| g.expires_at > NOW)
                .map(|g| g.expires_at)
                .min();
            let expr = synthesize(&agg, &scope(), &types(), NOW);
            prop_assert_eq!(expr.map(|e| e.expires_at), expected);
        }
    }
}
