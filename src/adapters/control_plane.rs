//! Control plane selection
//!
//! The control-plane generation is fixed for a run and picked from
//! configuration at startup.

use async_trait::async_trait;
use kube::Client;
use tracing::info;

use super::crd_control_plane::CrdControlPlane;
use super::rest_control_plane::RestControlPlane;
use crate::config::SentinelConfig;
use crate::domain::ports::{
    ControlPlane, ControlPlaneVersion, Nexus, NexusControl, Pool, Replica, StorageNode, Volume,
    VolumeId,
};
use crate::error::{Error, Result};

/// Either control-plane generation behind one port implementation.
#[derive(Debug, Clone)]
pub enum ControlPlaneClient {
    V0(CrdControlPlane),
    V1(RestControlPlane),
}

impl ControlPlaneClient {
    pub fn from_config(client: Client, config: &SentinelConfig) -> Result<Self> {
        let cp = match config.control_plane {
            ControlPlaneVersion::V0 => {
                ControlPlaneClient::V0(CrdControlPlane::new(client, config.namespace.clone()))
            }
            ControlPlaneVersion::V1 => ControlPlaneClient::V1(RestControlPlane::new(client, config)?),
        };
        info!(version = %config.control_plane, namespace = %config.namespace, "Selected control plane");
        Ok(cp)
    }

    fn inner(&self) -> &dyn ControlPlane {
        match self {
            ControlPlaneClient::V0(cp) => cp,
            ControlPlaneClient::V1(cp) => cp,
        }
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    fn version(&self) -> ControlPlaneVersion {
        self.inner().version()
    }

    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>> {
        self.inner().get_volume(volume_id).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.inner().list_volumes().await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        self.inner().delete_volume(volume_id).await
    }

    async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()> {
        self.inner().set_replica_count(volume_id, count).await
    }

    async fn get_nexus(&self, volume_id: &VolumeId) -> Result<Option<Nexus>> {
        self.inner().get_nexus(volume_id).await
    }

    async fn get_replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>> {
        self.inner().get_replicas(volume_id).await
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Pool>> {
        self.inner().get_pool(name).await
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.inner().list_pools().await
    }

    async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()> {
        self.inner().create_pool(name, node, disks).await
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.inner().delete_pool(name).await
    }

    async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        self.inner().list_storage_nodes().await
    }

    async fn get_storage_node(&self, name: &str) -> Result<Option<StorageNode>> {
        self.inner().get_storage_node(name).await
    }
}

#[async_trait]
impl NexusControl for ControlPlaneClient {
    async fn fault_child(&self, nexus: &Nexus, child_uri: &str) -> Result<()> {
        match self {
            ControlPlaneClient::V0(_) => Err(Error::fault(
                format!("fault child of nexus {}", nexus.uuid),
                "nexus child control requires the REST control plane",
            )),
            ControlPlaneClient::V1(cp) => cp.fault_child(nexus, child_uri).await,
        }
    }
}
