//! Property-Based Tests for Recompute and Transfer
//!
//! - recomputing the same entry twice persists identical bytes
//! - recomputing a subset of groups leaves the other entries untouched
//! - the persisted expiry is the minimum over the aggregate's entries
//! - transfer covers the union of event triples exactly once per pair
//! - at most one holder of a pair lock at any moment

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use tokio::runtime::Runtime;
use warrant_pipeline::{DistributedLocker, LockConfig};
use warrant_storage::{ChangeEventStore, InMemoryLockBackend};
use warrant_test_utils::fixtures::{entry, VIEW_HOST};
use warrant_test_utils::generators::{arb_change_events, arb_world, expected_union, seed_world};
use warrant_test_utils::now_unix;

#[path = "support/harness.rs"]
mod harness;
use harness::Pipeline;

const SUBJECT: i64 = 7;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn snapshot_bytes(p: &Pipeline) -> (Option<String>, Option<String>) {
    let aggregate = p
        .store
        .aggregate((SUBJECT, VIEW_HOST))
        .map(|a| serde_json::to_string(&a).unwrap());
    let expression = p
        .store
        .expression((SUBJECT, VIEW_HOST))
        .map(|e| serde_json::to_string(&e).unwrap());
    (aggregate, expression)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_recompute_is_idempotent(world in arb_world(5)) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let p = Pipeline::new();
            seed_world(&p.store, SUBJECT, VIEW_HOST, &world, now_unix());
            let groups: Vec<_> = world.iter().map(|g| g.group_pk).collect();

            p.handler.recompute(&entry(SUBJECT, VIEW_HOST, &groups)).await.unwrap();
            let first = snapshot_bytes(&p);
            p.handler.recompute(&entry(SUBJECT, VIEW_HOST, &groups)).await.unwrap();
            let second = snapshot_bytes(&p);

            prop_assert_eq!(first, second);
            Ok(())
        })?;
    }

    #[test]
    fn prop_untouched_groups_are_preserved(
        before in arb_world(5),
        after in arb_world(5),
        touched_mask in prop::collection::vec(any::<bool>(), 5),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let p = Pipeline::new();
            let now = now_unix();
            seed_world(&p.store, SUBJECT, VIEW_HOST, &before, now);
            let all: Vec<_> = before.iter().map(|g| g.group_pk).collect();
            p.handler.recompute(&entry(SUBJECT, VIEW_HOST, &all)).await.unwrap();
            let baseline = p.store.aggregate((SUBJECT, VIEW_HOST));

            // Grant state moves on, but only some groups are reported changed.
            seed_world(&p.store, SUBJECT, VIEW_HOST, &after, now);
            let touched: BTreeSet<_> = (1..=5i64)
                .filter(|g| touched_mask[(*g - 1) as usize])
                .collect();
            let touched_list: Vec<_> = touched.iter().copied().collect();
            p.handler.recompute(&entry(SUBJECT, VIEW_HOST, &touched_list)).await.unwrap();
            let updated = p.store.aggregate((SUBJECT, VIEW_HOST));

            let untouched = |agg: &Option<warrant_test_utils::SubjectActionGroupResource>| {
                agg.as_ref()
                    .map(|a| {
                        a.group_resource
                            .iter()
                            .filter(|(g, _)| !touched.contains(*g))
                            .map(|(g, r)| (*g, r.clone()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            };
            prop_assert_eq!(untouched(&baseline), untouched(&updated));
            Ok(())
        })?;
    }

    #[test]
    fn prop_expiry_is_minimum_of_entries(world in arb_world(5)) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let p = Pipeline::new();
            seed_world(&p.store, SUBJECT, VIEW_HOST, &world, now_unix());
            let groups: Vec<_> = world.iter().map(|g| g.group_pk).collect();
            p.handler.recompute(&entry(SUBJECT, VIEW_HOST, &groups)).await.unwrap();

            match p.store.aggregate((SUBJECT, VIEW_HOST)) {
                None => prop_assert!(p.store.expression((SUBJECT, VIEW_HOST)).is_none()),
                Some(aggregate) => {
                    let min = aggregate.group_resource.values().map(|g| g.expires_at).min();
                    let expression = p.store.expression((SUBJECT, VIEW_HOST));
                    prop_assert_eq!(expression.map(|e| e.expires_at), min);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_transfer_covers_union_once(events in arb_change_events()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let p = Pipeline::new();
            let expected = expected_union(&events);
            p.store.event_create_bulk(&events).await.unwrap();

            let report = p.transfer().await;
            let messages: Vec<_> = report.batches.iter().flat_map(|b| b.messages.iter()).collect();

            let pairs: BTreeSet<_> = messages.iter().map(|m| (m.subject_pk, m.action_pk)).collect();
            prop_assert_eq!(pairs.len(), messages.len());
            for message in &messages {
                prop_assert_eq!(
                    Some(&message.group_pks),
                    expected.get(&(message.subject_pk, message.action_pk))
                );
            }
            prop_assert_eq!(pairs.len(), expected.len());
            prop_assert!(report.batches.iter().all(|b| b.messages.len() <= p.transfer.batch_max_entries));
            Ok(())
        })?;
    }
}

// ============================================================================
// MUTUAL EXCLUSION
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pair_lock_has_single_holder() {
    let locker = DistributedLocker::new(
        Arc::new(InMemoryLockBackend::new()),
        LockConfig::development(),
    );
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let locker = locker.clone();
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            tokio::spawn(async move {
                for _ in 0..5 {
                    let guard = locker
                        .acquire_with_deadline(SUBJECT, VIEW_HOST, std::time::Duration::from_secs(10))
                        .await
                        .unwrap();
                    let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now_holding, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await.unwrap();
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}
