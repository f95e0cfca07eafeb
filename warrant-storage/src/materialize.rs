//! Resolve an aggregate's references and synthesize its expression.
//!
//! Shared by the recompute handler and the cache's refresh path.

use std::collections::BTreeMap;

use warrant_core::{
    synthesize, SubjectActionExpression, SubjectActionGroupResource, UnixSeconds, WarrantResult,
};

use crate::GrantSource;

/// Synthesize the expression for `aggregate` at `now`.
///
/// A vanished action or resource type drops the affected clauses rather
/// than failing; `None` means no valid expression.
pub async fn materialize<S>(
    source: &S,
    aggregate: &SubjectActionGroupResource,
    now: UnixSeconds,
) -> WarrantResult<Option<SubjectActionExpression>>
where
    S: GrantSource + ?Sized,
{
    if aggregate.is_empty() {
        return Ok(None);
    }

    let Some(scope) = source.action_scope(aggregate.action_pk).await? else {
        tracing::warn!(
            subject_pk = aggregate.subject_pk,
            action_pk = aggregate.action_pk,
            "Action no longer exists, dropping its expression"
        );
        return Ok(None);
    };

    let mut wanted = aggregate.resource_type_pks();
    wanted.insert(scope.resource_type_pk);
    let wanted: Vec<_> = wanted.into_iter().collect();

    let types: BTreeMap<_, _> = source
        .resource_types(&wanted)
        .await?
        .into_iter()
        .map(|rt| (rt.pk, rt))
        .collect();

    if types.len() < wanted.len() {
        let missing: Vec<_> = wanted.iter().filter(|pk| !types.contains_key(pk)).collect();
        tracing::warn!(
            subject_pk = aggregate.subject_pk,
            action_pk = aggregate.action_pk,
            missing = ?missing,
            "Unknown resource types, dropping their clauses"
        );
    }

    Ok(synthesize(aggregate, &scope, &types, now))
}
