//! Per-volume state observation.
//!
//! [`VolumeStateTracker`] follows one volume through
//! `Unknown -> Healthy <-> Degraded -> Faulted`. The storage engine drives
//! every transition; the tracker only waits for them to be observed. It does
//! not enforce a transition table.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::snapshot::StateSnapshotSource;
use super::waiter::{Observation, PollingWaiter};
use crate::domain::{
    Child, ChildState, DomainEvent, EventPublisher, NexusState, Replica, VolumeId, VolumeState,
};
use crate::error::{Error, Result};

/// Coarse lifecycle position of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Unknown,
    Healthy,
    Degraded,
    Faulted,
}

impl LifecycleState {
    /// Combine the volume and nexus views. The worse of the two wins.
    pub fn derive(volume: VolumeState, nexus: NexusState) -> Self {
        match (volume, nexus) {
            (VolumeState::Faulted, _) | (_, NexusState::Faulted) => LifecycleState::Faulted,
            (VolumeState::Degraded, _) | (_, NexusState::Degraded) => LifecycleState::Degraded,
            (VolumeState::Healthy, NexusState::Online | NexusState::Unknown) => {
                LifecycleState::Healthy
            }
            _ => LifecycleState::Unknown,
        }
    }
}

/// One-shot view of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeObservation {
    pub volume_state: VolumeState,
    pub nexus_state: NexusState,
    pub children: Vec<Child>,
    pub replicas: Vec<Replica>,
    pub lifecycle: LifecycleState,
}

/// Passive observer of a single volume.
#[derive(Clone)]
pub struct VolumeStateTracker {
    volume_id: VolumeId,
    snapshot: StateSnapshotSource,
    waiter: PollingWaiter,
    events: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for VolumeStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeStateTracker")
            .field("volume_id", &self.volume_id)
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl VolumeStateTracker {
    pub fn new(
        volume_id: VolumeId,
        snapshot: StateSnapshotSource,
        waiter: PollingWaiter,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            volume_id,
            snapshot,
            waiter,
            events,
        }
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.volume_id
    }

    pub fn snapshot(&self) -> &StateSnapshotSource {
        &self.snapshot
    }

    pub fn waiter(&self) -> &PollingWaiter {
        &self.waiter
    }

    /// Record the outcome of a wait as a domain event and pass it through.
    async fn settle<T>(&self, condition: &str, started: Instant, result: Result<T>) -> Result<T> {
        let event = match &result {
            Ok(_) => Some(DomainEvent::state_reached(
                self.volume_id.as_str(),
                condition,
                started.elapsed(),
            )),
            Err(Error::Timeout { last_observed, .. }) => Some(DomainEvent::wait_timed_out(
                self.volume_id.as_str(),
                condition,
                last_observed.clone(),
            )),
            Err(_) => None,
        };
        if let Some(event) = event {
            if let Err(e) = self.events.publish(event).await {
                warn!(error = %e, "failed to publish wait outcome");
            }
        }
        result
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait until the nexus reports `expected`.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_nexus_state(
        &self,
        expected: NexusState,
        timeout: Duration,
    ) -> Result<NexusState> {
        let condition = format!("nexus of {} {}", self.volume_id, expected);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let state = snapshot.nexus_state(id).await?;
                Ok(Observation::check(state == expected, state))
            })
            .await;
        self.settle(&condition, started, result).await
    }

    /// Wait until the nexus has exactly `expected` children.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_child_count(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<Child>> {
        let condition = format!("{} children on {}", expected, self.volume_id);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let children = snapshot.children(id).await?;
                let count = children.len();
                Ok(if count == expected {
                    Observation::Satisfied(children)
                } else {
                    Observation::Pending(children)
                })
            })
            .await;
        self.settle(&condition, started, result).await
    }

    /// Wait until the child at `index` reports `expected`.
    ///
    /// A missing child counts as not yet satisfied; a new replica may not
    /// have been appended to the nexus on the first polls.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_child_state(
        &self,
        index: usize,
        expected: ChildState,
        timeout: Duration,
    ) -> Result<Child> {
        let condition = format!("child {} of {} {}", index, self.volume_id, expected);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let child = snapshot.children(id).await?.into_iter().nth(index);
                Ok(match child {
                    Some(child) if child.state == expected => Observation::Satisfied(Some(child)),
                    other => Observation::Pending(other),
                })
            })
            .await
            .and_then(|child| {
                child.ok_or_else(|| Error::Internal("satisfied check without a child".into()))
            });
        self.settle(&condition, started, result).await
    }

    /// Wait until every child of the nexus is Online.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_children_online(&self, timeout: Duration) -> Result<Vec<Child>> {
        let condition = format!("all children of {} Online", self.volume_id);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let children = snapshot.children(id).await?;
                let online =
                    !children.is_empty() && children.iter().all(|c| c.state == ChildState::Online);
                Ok(Observation::check(online, children))
            })
            .await;
        self.settle(&condition, started, result).await
    }

    /// Wait until the volume reports `expected`.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_volume_state(
        &self,
        expected: VolumeState,
        timeout: Duration,
    ) -> Result<VolumeState> {
        let condition = format!("volume {} {}", self.volume_id, expected);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let state = snapshot.volume_state(id).await?;
                Ok(Observation::check(state == expected, state))
            })
            .await;
        self.settle(&condition, started, result).await
    }

    /// Wait until the volume has exactly `expected` replicas.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_replica_count(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<Replica>> {
        let condition = format!("{} replicas on {}", expected, self.volume_id);
        let started = Instant::now();
        let snapshot = &self.snapshot;
        let id = &self.volume_id;

        let result = self
            .waiter
            .with_timeout(timeout)
            .wait_for(&condition, || async move {
                let replicas = snapshot.replicas(id).await?;
                let count = replicas.len();
                Ok(Observation::check(count == expected, replicas))
            })
            .await;
        self.settle(&condition, started, result).await
    }

    /// Follow a rebuild of the child at `child_index` to completion.
    ///
    /// The child must be seen Degraded, then the nexus Degraded, then every
    /// child Online, then the nexus Online. All four steps share `timeout`.
    #[instrument(skip(self), fields(volume = %self.volume_id))]
    pub async fn wait_for_rebuild(&self, child_index: usize, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        let deadline = started + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        self.wait_for_child_state(child_index, ChildState::Degraded, remaining())
            .await?;
        self.wait_for_nexus_state(NexusState::Degraded, remaining())
            .await?;
        self.wait_for_children_online(remaining()).await?;
        self.wait_for_nexus_state(NexusState::Online, remaining())
            .await?;

        let elapsed = started.elapsed();
        info!(volume = %self.volume_id, child_index, ?elapsed, "rebuild complete");
        Ok(elapsed)
    }

    // =========================================================================
    // Single-shot Reads
    // =========================================================================

    /// Nodes currently hosting a replica of the volume.
    pub async fn current_replica_nodes(&self) -> Result<Vec<String>> {
        Ok(self
            .snapshot
            .replicas(&self.volume_id)
            .await?
            .into_iter()
            .map(|r| r.node)
            .collect())
    }

    pub async fn replica_count(&self) -> Result<usize> {
        Ok(self.snapshot.replicas(&self.volume_id).await?.len())
    }

    pub async fn child_count(&self) -> Result<usize> {
        Ok(self.snapshot.children(&self.volume_id).await?.len())
    }

    /// Read the volume once and derive its lifecycle position.
    pub async fn observe(&self) -> Result<VolumeObservation> {
        let volume = self.snapshot.volume(&self.volume_id).await?;
        let (nexus_state, children) = match volume.nexus {
            Some(nexus) => (nexus.state, nexus.children),
            None => (NexusState::Unknown, Vec::new()),
        };
        Ok(VolumeObservation {
            volume_state: volume.state,
            nexus_state,
            lifecycle: LifecycleState::derive(volume.state, nexus_state),
            children,
            replicas: volume.replicas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryEventCollector};
    use crate::domain::ControlPlane;
    use crate::metrics::SentinelMetrics;
    use assert_matches::assert_matches;

    fn tracker_for(
        cluster: &Arc<InMemoryCluster>,
        id: &VolumeId,
        events: Arc<InMemoryEventCollector>,
    ) -> VolumeStateTracker {
        VolumeStateTracker::new(
            id.clone(),
            StateSnapshotSource::new(cluster.clone()),
            PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(1)),
            events,
        )
    }

    // =========================================================================
    // Child Count Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_child_count_returns_on_exact_poll() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let extra = Child {
            uri: "nvmf://10.0.0.3:8420/nqn.2019-05.io.openebs:new?uuid=new".into(),
            state: ChildState::Degraded,
            node: Some("node-3".into()),
        };
        cluster.mutate_on_read(&id, 4, move |v| {
            if let Some(nexus) = v.nexus.as_mut() {
                nexus.children.push(extra);
            }
        });

        let metrics = SentinelMetrics::new(prometheus::Registry::new()).unwrap();
        let events = Arc::new(InMemoryEventCollector::new());
        let tracker = VolumeStateTracker::new(
            id.clone(),
            StateSnapshotSource::new(cluster.clone()),
            PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(1))
                .with_metrics(metrics.clone()),
            events.clone(),
        );

        let start = Instant::now();
        let children = tracker
            .wait_for_child_count(3, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(children.len(), 3);
        assert_eq!(metrics.polls(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(events.events_of_type("StateReached").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_count_timeout_publishes_event() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let events = Arc::new(InMemoryEventCollector::new());
        let tracker = tracker_for(&cluster, &id, events.clone());

        let err = tracker
            .wait_for_child_count(3, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(events.events_of_type("WaitTimedOut").len(), 1);
    }

    // =========================================================================
    // State Wait Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_nexus_state() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        cluster.set_nexus_state(&id, NexusState::Degraded);
        cluster.mutate_on_read(&id, 3, |v| {
            if let Some(n) = v.nexus.as_mut() {
                n.state = NexusState::Online;
            }
        });
        let tracker = tracker_for(&cluster, &id, Arc::new(InMemoryEventCollector::new()));

        let state = tracker
            .wait_for_nexus_state(NexusState::Online, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(state, NexusState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_state_out_of_range_is_pending() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));
        let tracker = tracker_for(&cluster, &id, Arc::new(InMemoryEventCollector::new()));

        let err = tracker
            .wait_for_child_state(1, ChildState::Degraded, Duration::from_secs(3))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Timeout { ref last_observed, .. } => {
            assert_eq!(last_observed, "None");
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_aborts_wait() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));
        cluster.fail_next_reads(1, 500);
        let events = Arc::new(InMemoryEventCollector::new());
        let tracker = tracker_for(&cluster, &id, events.clone());

        let err = tracker
            .wait_for_volume_state(VolumeState::Healthy, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert_matches!(err, Error::ControlPlane { status: 500, .. });
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_rebuild_after_scale_up() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));
        let tracker = tracker_for(&cluster, &id, Arc::new(InMemoryEventCollector::new()));

        cluster.set_replica_count(&id, 2).await.unwrap();
        tracker
            .wait_for_rebuild(1, Duration::from_secs(120))
            .await
            .unwrap();

        let observation = tracker.observe().await.unwrap();
        assert_eq!(observation.lifecycle, LifecycleState::Healthy);
        assert_eq!(observation.children.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_rebuild_shares_deadline() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        cluster.set_rebuild_reads(1000);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));
        let tracker = tracker_for(&cluster, &id, Arc::new(InMemoryEventCollector::new()));

        cluster.set_replica_count(&id, 2).await.unwrap();
        let start = Instant::now();
        let err = tracker
            .wait_for_rebuild(1, Duration::from_secs(20))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        // one budget for every step, plus at most one interval
        assert!(start.elapsed() <= Duration::from_secs(21));
    }

    // =========================================================================
    // Single-shot Read Tests
    // =========================================================================

    #[tokio::test]
    async fn test_counts_and_replica_nodes() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 3, Some("node-2"));
        let tracker = tracker_for(&cluster, &id, Arc::new(InMemoryEventCollector::new()));

        assert_eq!(tracker.replica_count().await.unwrap(), 3);
        assert_eq!(tracker.child_count().await.unwrap(), 3);
        let mut nodes = tracker.current_replica_nodes().await.unwrap();
        nodes.sort();
        assert_eq!(nodes, vec!["node-1", "node-2", "node-3"]);
    }

    #[test]
    fn test_lifecycle_derivation() {
        use LifecycleState::*;
        assert_eq!(
            LifecycleState::derive(VolumeState::Healthy, NexusState::Online),
            Healthy
        );
        assert_eq!(
            LifecycleState::derive(VolumeState::Healthy, NexusState::Degraded),
            Degraded
        );
        assert_eq!(
            LifecycleState::derive(VolumeState::Degraded, NexusState::Faulted),
            Faulted
        );
        assert_eq!(
            LifecycleState::derive(VolumeState::Unknown, NexusState::Online),
            Unknown
        );
    }
}
