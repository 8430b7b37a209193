//! Observation of volume, nexus and pool state.
//!
//! Everything here reads; nothing here changes the cluster.
//!
//! - [`StateSnapshotSource`] - uncached point reads through the control plane
//! - [`PollingWaiter`] - bounded polling of any async condition
//! - [`VolumeStateTracker`] - waits for per-volume transitions
//! - [`ReplicaPlacementReconciler`] - set comparisons of replica placement

mod placement;
mod proptest;
mod snapshot;
mod tracker;
mod waiter;

pub use placement::{
    diff as placement_diff, expected_after_node_loss, same_node_set, PlacementDiff,
    ReplicaPlacementReconciler,
};
pub use snapshot::StateSnapshotSource;
pub use tracker::{LifecycleState, VolumeObservation, VolumeStateTracker};
pub use waiter::{Observation, PollingWaiter};
