//! Fault injection
//!
//! [`FaultInjector`] applies controlled disruptions to a running cluster:
//! replica removal, nexus child faults, storage-engine suppression, power
//! loss, ungraceful reboot and network partitions.
//!
//! # Failure Semantics
//!
//! A fault that cannot be applied is a harness failure, not a failure of the
//! system under test. Every operation therefore reports
//! [`Error::FaultInjection`] on failure, publishes a `FaultFailed` event and
//! is never retried.
//!
//! # Background Faults
//!
//! The `spawn_*` operations run a delayed fault in its own task so that it
//! overlaps foreground I/O. They return a [`FaultHandle`] that the scenario
//! must join; a handle dropped without being joined is logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::config::FaultConfig;
use crate::domain::ports::{ENGINE_LABEL_KEY, ENGINE_LABEL_VALUE};
use crate::domain::{
    Child, ClusterObjects, ControlPlane, DomainEvent, EventPublisher, Nexus, NexusControl,
    NodeAgent, Platform, PowerState, VolumeId,
};
use crate::error::{Error, Result};
use crate::metrics::SentinelMetrics;
use crate::observer::PollingWaiter;

// =============================================================================
// Fault Handle
// =============================================================================

/// Join handle of a fault running in the background.
#[must_use = "a spawned fault must be joined so that its failure is not lost"]
pub struct FaultHandle {
    name: String,
    handle: Option<JoinHandle<Result<()>>>,
}

impl FaultHandle {
    fn new(name: impl Into<String>, handle: JoinHandle<Result<()>>) -> Self {
        Self {
            name: name.into(),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the fault task and return its outcome.
    ///
    /// A panicked or aborted task is reported as [`Error::Task`].
    pub async fn join(mut self) -> Result<()> {
        let name = std::mem::take(&mut self.name);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Task(format!("fault task '{}' already joined", name)))?;
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::Task(format!("fault task '{}' panicked", name))),
            Err(e) => Err(Error::Task(format!("fault task '{}' failed: {}", name, e))),
        }
    }
}

impl std::fmt::Debug for FaultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for FaultHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!(fault = %self.name, "fault task dropped without being joined");
        }
    }
}

// =============================================================================
// Fault Injector
// =============================================================================

/// Applies faults to the cluster through the control plane, Kubernetes,
/// the node agent and the cloud platform.
#[derive(Clone)]
pub struct FaultInjector {
    control_plane: Arc<dyn ControlPlane>,
    nexus: Arc<dyn NexusControl>,
    cluster: Arc<dyn ClusterObjects>,
    agent: Arc<dyn NodeAgent>,
    platform: Option<Arc<dyn Platform>>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<SentinelMetrics>,
    config: FaultConfig,
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("platform", &self.platform.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl FaultInjector {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        nexus: Arc<dyn NexusControl>,
        cluster: Arc<dyn ClusterObjects>,
        agent: Arc<dyn NodeAgent>,
        events: Arc<dyn EventPublisher>,
        config: FaultConfig,
    ) -> Self {
        Self {
            control_plane,
            nexus,
            cluster,
            agent,
            platform: None,
            events,
            metrics: None,
            config,
        }
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_metrics(mut self, metrics: SentinelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    /// Run `op`, then report the outcome as an event and a metric.
    async fn apply(
        &self,
        fault: &str,
        target: &str,
        op: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        match op.await {
            Ok(()) => {
                info!(fault, subject = target, "fault injected");
                if let Some(metrics) = &self.metrics {
                    metrics.record_fault(fault);
                }
                self.publish(DomainEvent::fault_injected(fault, target)).await;
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    err @ Error::FaultInjection { .. } => err,
                    other => Error::fault(format!("{} {}", fault, target), other),
                };
                warn!(fault, subject = target, error = %err, "fault injection failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_fault_failure(fault);
                }
                self.publish(DomainEvent::fault_failed(fault, target, err.to_string()))
                    .await;
                Err(err)
            }
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "failed to publish fault event");
        }
    }

    async fn nexus_of(&self, volume_id: &VolumeId) -> Result<Nexus> {
        self.control_plane
            .get_nexus(volume_id)
            .await?
            .ok_or_else(|| {
                Error::fault(
                    "nexus lookup",
                    format!("volume {} is not published", volume_id),
                )
            })
    }

    async fn node_ip(&self, node: &str) -> Result<String> {
        self.cluster
            .node_locations()
            .await?
            .into_iter()
            .find(|n| n.name == node)
            .map(|n| n.ip_address)
            .ok_or_else(|| Error::not_found("node", node))
    }

    fn platform(&self) -> Result<&Arc<dyn Platform>> {
        self.platform
            .as_ref()
            .ok_or_else(|| Error::fault("power control", "no platform configured"))
    }

    // =========================================================================
    // Replica Faults
    // =========================================================================

    /// Set the desired replica count of a volume.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()> {
        self.apply("set-replica-count", volume_id.as_str(), async {
            let volume = self
                .control_plane
                .get_volume(volume_id)
                .await?
                .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
            self.control_plane.set_replica_count(volume_id, count).await?;
            self.publish(DomainEvent::replica_count_changed(
                volume_id.as_str(),
                volume.desired_replicas,
                count,
            ))
            .await;
            Ok(())
        })
        .await
    }

    /// Remove one replica of a volume.
    ///
    /// Without a hint the desired replica count is lowered by one, which
    /// fails if it is already 1. With a hint the nexus child hosted on that
    /// node is faulted.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn remove_replica(&self, volume_id: &VolumeId, node_hint: Option<&str>) -> Result<()> {
        self.apply("remove-replica", volume_id.as_str(), async {
            match node_hint {
                None => {
                    let volume = self
                        .control_plane
                        .get_volume(volume_id)
                        .await?
                        .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
                    if volume.desired_replicas <= 1 {
                        return Err(Error::fault(
                            "remove-replica",
                            format!("volume {} already has a single replica", volume_id),
                        ));
                    }
                    let count = volume.desired_replicas - 1;
                    self.control_plane.set_replica_count(volume_id, count).await?;
                    self.publish(DomainEvent::replica_count_changed(
                        volume_id.as_str(),
                        volume.desired_replicas,
                        count,
                    ))
                    .await;
                    Ok(())
                }
                Some(node) => {
                    let nexus = self.nexus_of(volume_id).await?;
                    let replicas = self.control_plane.get_replicas(volume_id).await?;
                    let child = child_on_node(&nexus.children, &replicas, node).ok_or_else(|| {
                        Error::fault(
                            "remove-replica",
                            format!("no child of {} is hosted on {}", volume_id, node),
                        )
                    })?;
                    self.nexus.fault_child(&nexus, &child.uri).await
                }
            }
        })
        .await
    }

    /// Fault the nexus child at `index` after `delay`.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn fault_nexus_child(
        &self,
        volume_id: &VolumeId,
        index: usize,
        delay: Duration,
    ) -> Result<()> {
        sleep(delay).await;
        self.apply("fault-nexus-child", volume_id.as_str(), async {
            let nexus = self.nexus_of(volume_id).await?;
            let child = nexus.children.get(index).cloned().ok_or_else(|| {
                Error::fault(
                    "fault-nexus-child",
                    format!("nexus has {} children, no index {}", nexus.children.len(), index),
                )
            })?;
            self.nexus.fault_child(&nexus, &child.uri).await
        })
        .await
    }

    /// Fault the child backed by the replica local to the nexus.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn fault_local_nexus_child(&self, volume_id: &VolumeId) -> Result<()> {
        self.apply("fault-local-child", volume_id.as_str(), async {
            let nexus = self.nexus_of(volume_id).await?;
            let child = nexus
                .children
                .iter()
                .find(|c| c.is_local())
                .cloned()
                .ok_or_else(|| Error::fault("fault-local-child", "nexus has no local child"))?;
            self.nexus.fault_child(&nexus, &child.uri).await
        })
        .await
    }

    // =========================================================================
    // Engine Suppression
    // =========================================================================

    /// Remove the engine label from `node` after `delay` and wait for the
    /// engine pod to leave.
    #[instrument(skip(self))]
    pub async fn suppress_engine_on_node(&self, node: &str, delay: Duration) -> Result<()> {
        sleep(delay).await;
        self.apply("suppress-engine", node, async {
            self.cluster
                .set_node_label(node, ENGINE_LABEL_KEY, None)
                .await?;
            let cluster = &self.cluster;
            PollingWaiter::new(
                self.config.engine_unschedule_timeout(),
                self.config.engine_poll_interval(),
            )
            .wait_until(&format!("engine pod gone from {}", node), || async move {
                Ok(!cluster.engine_pod_running_on_node(node).await?)
            })
            .await
        })
        .await
    }

    /// Restore the engine label on `node` after `delay` and wait for the
    /// engine pod to run.
    #[instrument(skip(self))]
    pub async fn restore_engine_on_node(&self, node: &str, delay: Duration) -> Result<()> {
        sleep(delay).await;
        self.apply("restore-engine", node, async {
            self.cluster
                .set_node_label(node, ENGINE_LABEL_KEY, Some(ENGINE_LABEL_VALUE))
                .await?;
            let cluster = &self.cluster;
            PollingWaiter::new(
                self.config.engine_reschedule_timeout(),
                self.config.engine_poll_interval(),
            )
            .wait_until(&format!("engine pod running on {}", node), || async move {
                cluster.engine_pod_running_on_node(node).await
            })
            .await
        })
        .await
    }

    // =========================================================================
    // Node Faults
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn power_off_node(&self, node: &str) -> Result<()> {
        self.apply("power-off", node, async {
            self.platform()?.power_off_node(node).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn power_on_node(&self, node: &str) -> Result<()> {
        self.apply("power-on", node, async {
            self.platform()?.power_on_node(node).await
        })
        .await
    }

    pub async fn node_power_state(&self, node: &str) -> Result<PowerState> {
        self.platform()?.node_power_state(node).await
    }

    /// Crash and reboot `node` through its agent.
    #[instrument(skip(self))]
    pub async fn ungraceful_reboot(&self, node: &str) -> Result<()> {
        self.apply("ungraceful-reboot", node, async {
            let ip = self.node_ip(node).await?;
            self.agent.ungraceful_reboot(&ip).await
        })
        .await
    }

    /// Make `node` drop traffic from `from_nodes`.
    #[instrument(skip(self))]
    pub async fn drop_connections(&self, node: &str, from_nodes: &[String]) -> Result<()> {
        self.apply("drop-connections", node, async {
            let ip = self.node_ip(node).await?;
            self.agent.drop_connections_from_nodes(&ip, from_nodes).await
        })
        .await
    }

    /// Undo [`FaultInjector::drop_connections`].
    #[instrument(skip(self))]
    pub async fn accept_connections(&self, node: &str, from_nodes: &[String]) -> Result<()> {
        self.apply("accept-connections", node, async {
            let ip = self.node_ip(node).await?;
            self.agent.accept_connections_from_nodes(&ip, from_nodes).await
        })
        .await
    }

    // =========================================================================
    // Background Faults
    // =========================================================================

    /// Run `fault` in its own task.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, fault: F) -> FaultHandle
    where
        F: FnOnce(FaultInjector) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let injector = self.clone();
        FaultHandle::new(name, tokio::spawn(fault(injector)))
    }

    pub fn spawn_fault_nexus_child(
        &self,
        volume_id: VolumeId,
        index: usize,
        delay: Duration,
    ) -> FaultHandle {
        self.spawn("fault-nexus-child", move |injector| async move {
            injector.fault_nexus_child(&volume_id, index, delay).await
        })
    }

    /// Set the replica count after `delay`.
    pub fn spawn_set_replica_count(
        &self,
        volume_id: VolumeId,
        count: u32,
        delay: Duration,
    ) -> FaultHandle {
        self.spawn("set-replica-count", move |injector| async move {
            sleep(delay).await;
            injector.set_replica_count(&volume_id, count).await
        })
    }

    pub fn spawn_suppress_engine(&self, node: String, delay: Duration) -> FaultHandle {
        self.spawn("suppress-engine", move |injector| async move {
            injector.suppress_engine_on_node(&node, delay).await
        })
    }

    pub fn spawn_restore_engine(&self, node: String, delay: Duration) -> FaultHandle {
        self.spawn("restore-engine", move |injector| async move {
            injector.restore_engine_on_node(&node, delay).await
        })
    }

    /// Power off `node` after `delay`.
    pub fn spawn_power_off(&self, node: String, delay: Duration) -> FaultHandle {
        self.spawn("power-off", move |injector| async move {
            sleep(delay).await;
            injector.power_off_node(&node).await
        })
    }
}

/// Child of the nexus backed by a replica on `node`.
fn child_on_node<'a>(
    children: &'a [Child],
    replicas: &[crate::domain::Replica],
    node: &str,
) -> Option<&'a Child> {
    children
        .iter()
        .find(|c| c.node.as_deref() == Some(node))
        .or_else(|| {
            replicas
                .iter()
                .filter(|r| r.node == node)
                .find_map(|r| children.iter().find(|c| c.uri.contains(&r.uuid)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryEventCollector};
    use crate::domain::{NexusState, NodeState, VolumeState};
    use crate::observer::{StateSnapshotSource, VolumeStateTracker};
    use assert_matches::assert_matches;
    use tokio::time::Instant;

    fn injector(
        cluster: &Arc<InMemoryCluster>,
        events: Arc<InMemoryEventCollector>,
    ) -> FaultInjector {
        FaultInjector::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            events,
            FaultConfig::default(),
        )
    }

    // =========================================================================
    // Replica Fault Tests
    // =========================================================================

    #[tokio::test]
    async fn test_remove_replica_lowers_count() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 3, Some("node-1"));
        let events = Arc::new(InMemoryEventCollector::new());

        injector(&cluster, events.clone())
            .remove_replica(&id, None)
            .await
            .unwrap();

        assert_eq!(cluster.volume(&id).unwrap().desired_replicas, 2);
        assert_eq!(
            cluster.calls_starting_with("set_replica_count"),
            vec!["set_replica_count vol-1 2"]
        );
        assert_eq!(events.event_types(), vec!["ReplicaCountChanged", "FaultInjected"]);
    }

    #[tokio::test]
    async fn test_remove_last_replica_is_fault_failure() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));
        let events = Arc::new(InMemoryEventCollector::new());

        let err = injector(&cluster, events.clone())
            .remove_replica(&id, None)
            .await
            .unwrap_err();

        assert_matches!(err, Error::FaultInjection { .. });
        assert!(cluster.calls_starting_with("set_replica_count").is_empty());
        assert_eq!(events.events_of_type("FaultFailed").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_replica_with_hint_faults_that_child() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let remote = cluster.volume(&id).unwrap().nexus.unwrap().children[1].uri.clone();

        injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .remove_replica(&id, Some("node-2"))
            .await
            .unwrap();

        let calls = cluster.calls_starting_with("fault_child");
        assert_eq!(calls, vec![format!("fault_child vol-1 {}", remote)]);
        assert_eq!(cluster.volume(&id).unwrap().state, VolumeState::Degraded);
    }

    #[tokio::test]
    async fn test_fault_local_child() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));

        injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .fault_local_nexus_child(&id)
            .await
            .unwrap();

        let calls = cluster.calls_starting_with("fault_child");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("bdev:///"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_nexus_child_index_out_of_range() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let id = cluster.add_volume("vol-1", 1, Some("node-1"));

        let err = injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .fault_nexus_child(&id, 5, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(err, Error::FaultInjection { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_nexus_child_of_unpublished_volume() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let id = cluster.add_volume("vol-1", 1, None);

        let err = injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .fault_nexus_child(&id, 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::FaultInjection { ref reason, .. } if reason == "volume vol-1 is not published"
        );
        assert!(cluster.calls_starting_with("fault_child").is_empty());
    }

    // =========================================================================
    // Background Fault Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_spawned_fault_applies_after_delay() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));

        let handle = inj.spawn_set_replica_count(id.clone(), 3, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(cluster.calls_starting_with("set_replica_count").is_empty());

        handle.join().await.unwrap();
        assert_eq!(cluster.volume(&id).unwrap().desired_replicas, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_fault_error_surfaces_on_join() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));

        let handle = inj.spawn_fault_nexus_child(VolumeId::new("missing"), 0, Duration::ZERO);
        let err = handle.join().await.unwrap_err();
        assert_matches!(err, Error::FaultInjection { .. });
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_child_fault_overlaps_state_wait() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let events = Arc::new(InMemoryEventCollector::new());
        let inj = injector(&cluster, events.clone());
        let tracker = VolumeStateTracker::new(
            id.clone(),
            StateSnapshotSource::new(cluster.clone()),
            PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(1)),
            events,
        );

        let start = Instant::now();
        let handle = inj.spawn_fault_nexus_child(id.clone(), 1, Duration::from_secs(10));
        tracker
            .wait_for_nexus_state(NexusState::Degraded, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(10));
        handle.join().await.unwrap();
        assert_eq!(cluster.calls_starting_with("fault_child").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_engine_faults_overlap_node_wait() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));
        let snapshot = StateSnapshotSource::new(cluster.clone());
        let waiter = PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(1));
        let snapshot = &snapshot;

        let start = Instant::now();
        let suppress = inj.spawn_suppress_engine("node-2".to_string(), Duration::from_secs(5));
        waiter
            .wait_until("node-2 offline", || async move {
                Ok(snapshot.storage_node_state("node-2").await? == NodeState::Offline)
            })
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
        suppress.join().await.unwrap();

        let restore = inj.spawn_restore_engine("node-2".to_string(), Duration::from_secs(5));
        waiter
            .wait_until("node-2 online", || async move {
                Ok(snapshot.storage_node_state("node-2").await? == NodeState::Online)
            })
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        restore.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_power_off_overlaps_power_wait() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .with_platform(cluster.clone());
        let waiter = PollingWaiter::new(Duration::from_secs(60), Duration::from_secs(1));
        let faults = &inj;

        let start = Instant::now();
        let handle = inj.spawn_power_off("node-2".to_string(), Duration::from_secs(8));
        waiter
            .wait_until("node-2 powered off", || async move {
                Ok(faults.node_power_state("node-2").await? == PowerState::Off)
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(8));
        handle.join().await.unwrap();
        assert!(cluster.is_powered_off("node-2"));
    }

    #[tokio::test]
    async fn test_panicking_fault_is_task_error() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));

        let handle = inj.spawn("boom", |_| async { panic!("fault task blew up") });
        let err = handle.join().await.unwrap_err();
        assert_matches!(err, Error::Task(ref msg) if msg.contains("panicked"));
    }

    // =========================================================================
    // Engine / Node Fault Tests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_suppress_and_restore_engine() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));

        inj.suppress_engine_on_node("node-2", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cluster.node_label("node-2", ENGINE_LABEL_KEY), None);
        assert!(!cluster.engine_pod_running_on_node("node-2").await.unwrap());
        assert_eq!(
            cluster.get_storage_node("node-2").await.unwrap().unwrap().state,
            NodeState::Offline
        );

        inj.restore_engine_on_node("node-2", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(
            cluster.node_label("node-2", ENGINE_LABEL_KEY).as_deref(),
            Some(ENGINE_LABEL_VALUE)
        );
    }

    #[tokio::test]
    async fn test_power_without_platform_fails() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let err = injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .power_off_node("node-1")
            .await
            .unwrap_err();
        assert_matches!(err, Error::FaultInjection { ref reason, .. } if reason.contains("no platform"));
    }

    #[tokio::test]
    async fn test_power_cycle_with_platform() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()))
            .with_platform(cluster.clone());

        inj.power_off_node("node-2").await.unwrap();
        assert_eq!(inj.node_power_state("node-2").await.unwrap(), PowerState::Off);
        inj.power_on_node("node-2").await.unwrap();
        assert_eq!(
            inj.node_power_state("node-2").await.unwrap(),
            PowerState::Running
        );
    }

    #[tokio::test]
    async fn test_partition_and_reboot_use_node_ip() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let inj = injector(&cluster, Arc::new(InMemoryEventCollector::new()));
        let peers = vec!["node-1".to_string()];

        inj.drop_connections("node-2", &peers).await.unwrap();
        assert_eq!(cluster.dropped_connections("node-2"), peers);
        inj.accept_connections("node-2", &peers).await.unwrap();
        assert!(cluster.dropped_connections("node-2").is_empty());

        inj.ungraceful_reboot("node-2").await.unwrap();
        assert_eq!(
            cluster.calls_starting_with("agent ungraceful_reboot"),
            vec!["agent ungraceful_reboot 10.0.0.2"]
        );

        let err = inj.ungraceful_reboot("node-9").await.unwrap_err();
        assert_matches!(err, Error::FaultInjection { .. });
    }
}
