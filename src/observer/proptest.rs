//! Property-Based Tests for Observation
//!
//! # Test Properties
//!
//! 1. **Immediate Success**: a satisfied first poll returns without sleeping
//! 2. **Timeout Window**: a never-satisfied check fails in `[timeout, timeout + interval]`
//! 3. **Exact Poll**: a child count reached at poll `k` is reported after exactly `k` polls
//! 4. **Set Equality**: placement comparison ignores order and duplicates

#![cfg(test)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use super::placement::{diff, same_node_set};
use super::snapshot::StateSnapshotSource;
use super::tracker::VolumeStateTracker;
use super::waiter::{Observation, PollingWaiter};
use crate::adapters::{InMemoryCluster, InMemoryEventCollector};
use crate::domain::{Child, ChildState};

// =============================================================================
// Property Strategies
// =============================================================================

/// (timeout, interval) in milliseconds with `timeout >= interval`.
fn timing_strategy() -> impl Strategy<Value = (u64, u64)> {
    (1u64..=5_000).prop_flat_map(|interval| (interval..=interval * 40, Just(interval)))
}

/// Arbitrary (timeout, interval) in milliseconds.
fn any_timing_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..=120_000, 1u64..=10_000)
}

fn node_names() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("n[0-9]", 0..6)
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

// =============================================================================
// Waiter Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_satisfied_returns_within_one_interval((timeout, interval) in timing_strategy()) {
        let elapsed = paused_runtime().block_on(async move {
            let waiter = PollingWaiter::new(
                Duration::from_millis(timeout),
                Duration::from_millis(interval),
            );
            let start = Instant::now();
            let result = waiter.wait_for("always", || async { Ok(Observation::Satisfied(())) }).await;
            assert!(result.is_ok());
            start.elapsed()
        });
        prop_assert!(elapsed <= Duration::from_millis(interval));
    }

    #[test]
    fn prop_never_satisfied_times_out_in_window((timeout, interval) in any_timing_strategy()) {
        let (elapsed, is_timeout) = paused_runtime().block_on(async move {
            let waiter = PollingWaiter::new(
                Duration::from_millis(timeout),
                Duration::from_millis(interval),
            );
            let start = Instant::now();
            let result = waiter.wait_for("never", || async { Ok(Observation::Pending(())) }).await;
            (start.elapsed(), result.map_err(|e| e.is_timeout()).err().unwrap_or(false))
        });
        prop_assert!(is_timeout);
        prop_assert!(elapsed >= Duration::from_millis(timeout));
        prop_assert!(elapsed <= Duration::from_millis(timeout + interval));
    }

    #[test]
    fn prop_polls_until_kth((k, interval) in (1usize..20, 1u64..=1_000)) {
        let polls = paused_runtime().block_on(async move {
            let waiter = PollingWaiter::new(Duration::from_secs(3600), Duration::from_millis(interval));
            let polls = Arc::new(AtomicUsize::new(0));
            let counter = polls.clone();
            waiter
                .wait_for("kth", || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(Observation::check(n >= k, n))
                    }
                })
                .await
                .unwrap();
            polls.load(Ordering::SeqCst)
        });
        prop_assert_eq!(polls, k);
    }
}

// =============================================================================
// Tracker Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_child_count_exact_poll((n, k) in (1usize..=3, 1usize..=12)) {
        let polls = paused_runtime().block_on(async move {
            let names = ["node-1", "node-2", "node-3", "node-4"];
            let cluster = InMemoryCluster::with_nodes(&names);
            let id = cluster.add_volume("vol-1", (n - 1).max(1) as u32, Some("node-1"));
            cluster.with_volume(&id, |v| {
                if let Some(nexus) = v.nexus.as_mut() {
                    nexus.children.truncate(n - 1);
                }
            });
            cluster.mutate_on_read(&id, k, move |v| {
                if let Some(nexus) = v.nexus.as_mut() {
                    nexus.children.push(Child {
                        uri: "nvmf://10.0.0.4:8420/nqn.2019-05.io.openebs:late?uuid=late".into(),
                        state: ChildState::Degraded,
                        node: Some("node-4".into()),
                    });
                }
            });

            let metrics = crate::metrics::SentinelMetrics::new(prometheus::Registry::new()).unwrap();
            let tracker = VolumeStateTracker::new(
                id,
                StateSnapshotSource::new(cluster.clone()),
                PollingWaiter::new(Duration::from_secs(600), Duration::from_secs(1))
                    .with_metrics(metrics.clone()),
                Arc::new(InMemoryEventCollector::new()),
            );
            tracker
                .wait_for_child_count(n, Duration::from_secs(600))
                .await
                .unwrap();
            metrics.polls()
        });
        prop_assert_eq!(polls, k as u64);
    }
}

// =============================================================================
// Placement Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_set_equality_ignores_order(nodes in node_names(), seed in any::<u64>()) {
        let mut shuffled = nodes.clone();
        // deterministic rotation stands in for a shuffle
        if !shuffled.is_empty() {
            let by = (seed as usize) % shuffled.len();
            shuffled.rotate_left(by);
        }
        prop_assert!(same_node_set(&nodes, &shuffled));
    }

    #[test]
    fn prop_set_equality_matches_btreeset(a in node_names(), b in node_names()) {
        let sa: std::collections::BTreeSet<_> = a.iter().collect();
        let sb: std::collections::BTreeSet<_> = b.iter().collect();
        prop_assert_eq!(same_node_set(&a, &b), sa == sb);
    }

    #[test]
    fn prop_diff_is_disjoint(a in node_names(), b in node_names()) {
        let d = diff(&a, &b);
        for node in &d.missing {
            prop_assert!(b.contains(node) && !a.contains(node));
        }
        for node in &d.unexpected {
            prop_assert!(a.contains(node) && !b.contains(node));
        }
    }
}
