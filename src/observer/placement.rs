//! Replica placement checks.
//!
//! Single-shot comparisons between where replicas are and where they should
//! be. Nothing here polls; wrap a check in a
//! [`PollingWaiter`](super::PollingWaiter) when it must hold during a
//! transition.

use std::collections::BTreeSet;

use tracing::debug;

use super::snapshot::StateSnapshotSource;
use super::tracker::VolumeStateTracker;
use crate::domain::VolumeId;
use crate::error::Result;

/// Difference between an observed and an expected node set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementDiff {
    /// Expected but not observed
    pub missing: Vec<String>,
    /// Observed but not expected
    pub unexpected: Vec<String>,
}

impl PlacementDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Unordered set comparison of two node lists. Duplicates are ignored.
pub fn same_node_set<A: AsRef<str>, B: AsRef<str>>(observed: &[A], expected: &[B]) -> bool {
    diff(observed, expected).is_empty()
}

/// Set difference in both directions, sorted.
pub fn diff<A: AsRef<str>, B: AsRef<str>>(observed: &[A], expected: &[B]) -> PlacementDiff {
    let observed: BTreeSet<&str> = observed.iter().map(AsRef::as_ref).collect();
    let expected: BTreeSet<&str> = expected.iter().map(AsRef::as_ref).collect();
    PlacementDiff {
        missing: expected
            .difference(&observed)
            .map(|s| s.to_string())
            .collect(),
        unexpected: observed
            .difference(&expected)
            .map(|s| s.to_string())
            .collect(),
    }
}

/// Nodes from `current` that must still hold a replica after `lost` goes away.
pub fn expected_after_node_loss<A: AsRef<str>>(current: &[A], lost: &str) -> Vec<String> {
    let survivors: BTreeSet<&str> = current
        .iter()
        .map(AsRef::as_ref)
        .filter(|n| *n != lost)
        .collect();
    survivors.into_iter().map(str::to_string).collect()
}

/// Checks replica placement against expectations.
#[derive(Debug, Clone)]
pub struct ReplicaPlacementReconciler {
    snapshot: StateSnapshotSource,
}

impl ReplicaPlacementReconciler {
    pub fn new(snapshot: StateSnapshotSource) -> Self {
        Self { snapshot }
    }

    /// True iff the tracker's replica nodes equal `expected` as a set.
    pub async fn verify_replica_on_nodes(
        &self,
        tracker: &VolumeStateTracker,
        expected: &[String],
    ) -> Result<bool> {
        let observed = tracker.current_replica_nodes().await?;
        let result = diff(&observed, expected);
        if !result.is_empty() {
            debug!(
                volume = %tracker.volume_id(),
                missing = ?result.missing,
                unexpected = ?result.unexpected,
                "replica placement differs"
            );
        }
        Ok(result.is_empty())
    }

    /// Placement difference for reporting.
    pub async fn placement_diff(
        &self,
        tracker: &VolumeStateTracker,
        expected: &[String],
    ) -> Result<PlacementDiff> {
        let observed = tracker.current_replica_nodes().await?;
        Ok(diff(&observed, expected))
    }

    /// Replica nodes of `volume_id` that do not host an Online pool.
    ///
    /// An empty result means every replica sits on a healthy pool.
    pub async fn replicas_on_unhealthy_pools(&self, volume_id: &VolumeId) -> Result<Vec<String>> {
        let replicas = self.snapshot.replicas(volume_id).await?;
        let pools = self.snapshot.pools().await?;
        Ok(replicas
            .into_iter()
            .filter(|r| {
                !pools
                    .iter()
                    .any(|p| p.node == r.node && p.name == r.pool && p.is_online())
            })
            .map(|r| r.node)
            .collect())
    }

    pub async fn verify_replicas_on_healthy_pools(&self, volume_id: &VolumeId) -> Result<bool> {
        Ok(self.replicas_on_unhealthy_pools(volume_id).await?.is_empty())
    }
}
