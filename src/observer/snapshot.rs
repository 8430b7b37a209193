//! Point-in-time reads of cluster state.
//!
//! [`StateSnapshotSource`] answers every question from a fresh control-plane
//! call. It never caches and never retries; retrying is the waiter's job.

use std::sync::Arc;

use tracing::instrument;

use crate::domain::{
    Child, ControlPlane, NexusState, NodeState, Pool, Replica, StateTokens, Volume, VolumeId,
    VolumeState,
};
use crate::error::{Error, Result};

/// Pass-through reader over the control plane.
#[derive(Clone)]
pub struct StateSnapshotSource {
    control_plane: Arc<dyn ControlPlane>,
}

impl std::fmt::Debug for StateSnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSnapshotSource")
            .field("version", &self.control_plane.version())
            .finish()
    }
}

impl StateSnapshotSource {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    pub fn tokens(&self) -> &'static StateTokens {
        self.control_plane.tokens()
    }

    // =========================================================================
    // Nexus / Replica Reads
    // =========================================================================

    /// Nexus state of a volume, `Unknown` when the volume has no nexus.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn nexus_state(&self, volume_id: &VolumeId) -> Result<NexusState> {
        Ok(self
            .control_plane
            .get_nexus(volume_id)
            .await?
            .map(|n| n.state)
            .unwrap_or_default())
    }

    /// Nexus children in the order the nexus reports them. Empty without a nexus.
    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn children(&self, volume_id: &VolumeId) -> Result<Vec<Child>> {
        Ok(self
            .control_plane
            .get_nexus(volume_id)
            .await?
            .map(|n| n.children)
            .unwrap_or_default())
    }

    #[instrument(skip(self), fields(volume = %volume_id))]
    pub async fn replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>> {
        self.control_plane.get_replicas(volume_id).await
    }

    /// Bytes used in a pool.
    #[instrument(skip(self))]
    pub async fn pool_usage(&self, pool: &str) -> Result<u64> {
        Ok(self.pool(pool).await?.used)
    }

    // =========================================================================
    // Volume Reads
    // =========================================================================

    pub async fn volume(&self, volume_id: &VolumeId) -> Result<Volume> {
        self.control_plane
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))
    }

    pub async fn volume_state(&self, volume_id: &VolumeId) -> Result<VolumeState> {
        Ok(self.volume(volume_id).await?.state)
    }

    /// Nexus node followed by every replica node, without duplicates.
    pub async fn volume_nodes(&self, volume_id: &VolumeId) -> Result<Vec<String>> {
        let volume = self.volume(volume_id).await?;
        let mut nodes = Vec::new();
        if let Some(nexus) = &volume.nexus {
            nodes.push(nexus.node.clone());
        }
        for replica in &volume.replicas {
            if !nodes.contains(&replica.node) {
                nodes.push(replica.node.clone());
            }
        }
        Ok(nodes)
    }

    pub async fn is_published(&self, volume_id: &VolumeId) -> Result<bool> {
        Ok(self.volume(volume_id).await?.is_published())
    }

    /// True once the control plane no longer knows the volume.
    pub async fn is_deleted(&self, volume_id: &VolumeId) -> Result<bool> {
        match self.control_plane.get_volume(volume_id).await {
            Ok(volume) => Ok(volume.is_none()),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub async fn any_volumes(&self) -> Result<bool> {
        Ok(!self.control_plane.list_volumes().await?.is_empty())
    }

    /// Volumes whose state is anything but healthy.
    pub async fn unhealthy_volumes(&self) -> Result<Vec<Volume>> {
        Ok(self
            .control_plane
            .list_volumes()
            .await?
            .into_iter()
            .filter(|v| v.state != VolumeState::Healthy)
            .collect())
    }

    // =========================================================================
    // Pool / Node Reads
    // =========================================================================

    pub async fn pool(&self, name: &str) -> Result<Pool> {
        self.control_plane
            .get_pool(name)
            .await?
            .ok_or_else(|| Error::not_found("pool", name))
    }

    pub async fn pools(&self) -> Result<Vec<Pool>> {
        self.control_plane.list_pools().await
    }

    /// Sum of `used` over every pool in the cluster.
    pub async fn cluster_pool_usage(&self) -> Result<u64> {
        Ok(self.pools().await?.iter().map(|p| p.used).sum())
    }

    /// State of a storage-engine node, `Unknown` if it is not registered.
    pub async fn storage_node_state(&self, name: &str) -> Result<NodeState> {
        Ok(self
            .control_plane
            .get_storage_node(name)
            .await?
            .map(|n| n.state)
            .unwrap_or_default())
    }
}
