//! Storage pool reconciliation
//!
//! The configured pool layout is one pool per storage-engine node, named
//! `pool-on-<node>` and built on the configured device. Fault scenarios
//! destroy and rename pools; [`PoolReconciler::restore_configured_pools`]
//! brings the cluster back to that layout before the next volume is
//! provisioned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::PoolConfig;
use crate::domain::{ClusterObjects, ControlPlane, DomainEvent, EventPublisher, Pool};
use crate::error::Result;
use crate::metrics::SentinelMetrics;
use crate::observer::{Observation, PollingWaiter, StateSnapshotSource};

/// Outcome of a pool restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl RestoreReport {
    /// True if the cluster already had the configured layout.
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

/// `disk` names `device`, with or without a URI scheme such as `aio://`.
fn disk_matches(disk: &str, device: &str) -> bool {
    let disk = disk.split('?').next().unwrap_or(disk);
    disk == device || disk.split_once("://").is_some_and(|(_, path)| path == device)
}

/// Creates, deletes and waits on storage pools.
#[derive(Clone)]
pub struct PoolReconciler {
    control_plane: Arc<dyn ControlPlane>,
    cluster: Arc<dyn ClusterObjects>,
    snapshot: StateSnapshotSource,
    events: Arc<dyn EventPublisher>,
    metrics: Option<SentinelMetrics>,
    config: PoolConfig,
}

impl std::fmt::Debug for PoolReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolReconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl PoolReconciler {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        cluster: Arc<dyn ClusterObjects>,
        events: Arc<dyn EventPublisher>,
        config: PoolConfig,
    ) -> Self {
        Self {
            snapshot: StateSnapshotSource::new(control_plane.clone()),
            control_plane,
            cluster,
            events,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: SentinelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn waiter(&self, timeout: Duration, interval: Duration) -> PollingWaiter {
        let waiter = PollingWaiter::new(timeout, interval);
        match &self.metrics {
            Some(metrics) => waiter.with_metrics(metrics.clone()),
            None => waiter,
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "failed to publish pool event");
        }
    }

    // =========================================================================
    // Layout Restore
    // =========================================================================

    /// Bring pools back to the configured layout and wait for all of them to
    /// come Online.
    ///
    /// Pools that already match are left alone, so a second call with no
    /// intervening fault changes nothing.
    #[instrument(skip(self))]
    pub async fn restore_configured_pools(&self) -> Result<RestoreReport> {
        let desired: BTreeMap<String, String> = self
            .cluster
            .node_locations()
            .await?
            .into_iter()
            .filter(|n| n.storage_node)
            .map(|n| (PoolConfig::pool_name_for(&n.name), n.name))
            .collect();
        let device = self.config.device.clone();

        let mut report = RestoreReport::default();
        for pool in self.control_plane.list_pools().await? {
            let matches = desired.get(&pool.name).is_some_and(|node| {
                *node == pool.node
                    && pool.disks.len() == 1
                    && disk_matches(&pool.disks[0], &device)
            });
            if matches {
                report.unchanged.push(pool.name);
            } else {
                self.delete_pool(&pool.name).await?;
                self.wait_pool_deleted(&pool.name, self.config.create_timeout())
                    .await?;
                report.deleted.push(pool.name);
            }
        }

        for (name, node) in &desired {
            if report.unchanged.contains(name) {
                continue;
            }
            self.create_pool(name, node, std::slice::from_ref(&device))
                .await?;
            report.created.push(name.clone());
        }

        let names: Vec<String> = desired.keys().cloned().collect();
        self.wait_named_pools_online(&names, self.config.create_timeout())
            .await?;

        info!(
            created = report.created.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged.len(),
            "pools restored"
        );
        self.publish(DomainEvent::pools_restored(
            report.created.len(),
            report.deleted.len(),
            report.unchanged.len(),
        ))
        .await;
        Ok(report)
    }

    // =========================================================================
    // Pool Operations
    // =========================================================================

    pub async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()> {
        self.control_plane.create_pool(name, node, disks).await?;
        info!(pool = name, node, "pool created");
        self.publish(DomainEvent::pool_created(name, node)).await;
        Ok(())
    }

    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        self.control_plane.delete_pool(name).await?;
        info!(pool = name, "pool deleted");
        self.publish(DomainEvent::pool_deleted(name)).await;
        Ok(())
    }

    /// Create `new_name` on the node and disks of `old`.
    #[instrument(skip(self, old), fields(old = %old.name))]
    pub async fn recreate_pool(&self, old: &Pool, new_name: &str) -> Result<()> {
        self.create_pool(new_name, &old.node, &old.disks).await
    }

    // =========================================================================
    // Pool Waits
    // =========================================================================

    /// Wait for every pool the control plane reports to be Online.
    pub async fn wait_pools_online(&self, timeout: Duration) -> Result<()> {
        let snapshot = &self.snapshot;
        self.waiter(timeout, self.config.create_interval())
            .wait_for("all pools online", || async move {
                let offline: Vec<String> = snapshot
                    .pools()
                    .await?
                    .into_iter()
                    .filter(|p| !p.is_online())
                    .map(|p| format!("{}={}", p.name, p.state))
                    .collect();
                Ok(Observation::check(offline.is_empty(), offline))
            })
            .await
            .map(|_| ())
    }

    async fn wait_named_pools_online(&self, names: &[String], timeout: Duration) -> Result<()> {
        let control_plane = &self.control_plane;
        self.waiter(timeout, self.config.create_interval())
            .wait_for("configured pools online", || async move {
                let pools = control_plane.list_pools().await?;
                let pending: Vec<String> = names
                    .iter()
                    .filter(|name| !pools.iter().any(|p| p.name == **name && p.is_online()))
                    .cloned()
                    .collect();
                Ok(Observation::check(pending.is_empty(), pending))
            })
            .await
            .map(|_| ())
    }

    /// Wait for `name` to exist and be Online.
    pub async fn wait_pool_online(&self, name: &str, timeout: Duration) -> Result<()> {
        self.wait_pool_online_every(name, timeout, self.config.create_interval())
            .await
    }

    pub(crate) async fn wait_pool_online_every(
        &self,
        name: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let control_plane = &self.control_plane;
        self.waiter(timeout, interval)
            .wait_for(&format!("pool {} online", name), || async move {
                let state = control_plane.get_pool(name).await?.map(|p| p.state);
                Ok(Observation::check(
                    state.is_some_and(|s| s == crate::domain::PoolState::Online),
                    state,
                ))
            })
            .await
            .map(|_| ())
    }

    /// Wait for the pool's `used` bytes to reach zero.
    pub async fn wait_pool_usage_zero(&self, name: &str, timeout: Duration) -> Result<()> {
        let snapshot = &self.snapshot;
        self.waiter(timeout, self.config.create_interval())
            .wait_for(&format!("pool {} usage zero", name), || async move {
                let used = snapshot.pool_usage(name).await?;
                Ok(Observation::check(used == 0, used))
            })
            .await
            .map(|_| ())
    }

    /// Wait for `name` to disappear from the control plane.
    pub async fn wait_pool_deleted(&self, name: &str, timeout: Duration) -> Result<()> {
        let control_plane = &self.control_plane;
        self.waiter(timeout, self.config.delete_interval())
            .wait_for(&format!("pool {} deleted", name), || async move {
                let state = control_plane.get_pool(name).await?.map(|p| p.state);
                Ok(Observation::check(state.is_none(), state))
            })
            .await
            .map(|_| ())
    }

    /// Total bytes used across all pools.
    pub async fn cluster_usage(&self) -> Result<u64> {
        self.snapshot.cluster_pool_usage().await
    }
}
