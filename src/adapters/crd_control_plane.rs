//! Custom-resource control plane
//!
//! Implements the `ControlPlane` port for the 0.8 control plane, where all
//! volume, pool and node state lives in `openebs.io/v1alpha1` resources.

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::crd::{MayastorPool, MayastorPoolSpec, MayastorVolume};
use crate::domain::ports::{
    ControlPlane, ControlPlaneVersion, Nexus, Pool, Replica, StateTokens, StorageNode, Volume,
    VolumeId,
};
use crate::error::{Error, Result};

/// Field manager recorded on patches.
const FIELD_MANAGER: &str = "replica-sentinel";

/// Control plane backed by the 0.8 custom resources.
#[derive(Clone)]
pub struct CrdControlPlane {
    client: Client,
    namespace: String,
}

impl CrdControlPlane {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn volumes_api(&self) -> Api<MayastorVolume> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pools_api(&self) -> Api<MayastorPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// `MayastorNode` has a plain string `status`, which the typed derive
    /// cannot express, so it is read as a dynamic object.
    fn nodes_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("openebs.io", "v1alpha1", "MayastorNode");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "mayastornodes");
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }

    fn storage_node_from(obj: &DynamicObject) -> Option<StorageNode> {
        let name = obj.metadata.name.clone()?;
        let status = obj
            .data
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        Some(StorageNode {
            name,
            state: StateTokens::V0.node_state(status),
        })
    }

    async fn volume_or_not_found(&self, volume_id: &VolumeId) -> Result<Volume> {
        self.get_volume(volume_id)
            .await?
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))
    }
}

impl std::fmt::Debug for CrdControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdControlPlane")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl ControlPlane for CrdControlPlane {
    fn version(&self) -> ControlPlaneVersion {
        ControlPlaneVersion::V0
    }

    #[instrument(skip(self))]
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>> {
        match self.volumes_api().get(volume_id.as_str()).await {
            Ok(msv) => Ok(Some(msv.to_volume(self.tokens()))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let volumes = self.volumes_api().list(&ListParams::default()).await?;
        Ok(volumes
            .items
            .iter()
            .map(|msv| msv.to_volume(self.tokens()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        self.volumes_api()
            .delete(volume_id.as_str(), &DeleteParams::default())
            .await?;
        info!(volume = %volume_id, "Requested volume deletion");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()> {
        let patch = json!({ "spec": { "replicaCount": count } });
        let params = PatchParams::apply(FIELD_MANAGER);
        self.volumes_api()
            .patch(volume_id.as_str(), &params, &Patch::Merge(&patch))
            .await?;
        debug!(volume = %volume_id, count, "Patched replicaCount");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_nexus(&self, volume_id: &VolumeId) -> Result<Option<Nexus>> {
        Ok(self.volume_or_not_found(volume_id).await?.nexus)
    }

    #[instrument(skip(self))]
    async fn get_replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>> {
        Ok(self.volume_or_not_found(volume_id).await?.replicas)
    }

    #[instrument(skip(self))]
    async fn get_pool(&self, name: &str) -> Result<Option<Pool>> {
        match self.pools_api().get(name).await {
            Ok(msp) => Ok(Some(msp.to_pool(self.tokens()))),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let pools = self.pools_api().list(&ListParams::default()).await?;
        Ok(pools
            .items
            .iter()
            .map(|msp| msp.to_pool(self.tokens()))
            .collect())
    }

    #[instrument(skip(self))]
    async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()> {
        let msp = MayastorPool::new(
            name,
            MayastorPoolSpec {
                disks: disks.to_vec(),
                node: node.to_string(),
            },
        );
        self.pools_api().create(&PostParams::default(), &msp).await?;
        info!(pool = name, node, "Created MayastorPool");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_pool(&self, name: &str) -> Result<()> {
        match self.pools_api().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::not_found("pool", name)),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        let nodes = self.nodes_api().list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .iter()
            .filter_map(Self::storage_node_from)
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_storage_node(&self, name: &str) -> Result<Option<StorageNode>> {
        match self.nodes_api().get(name).await {
            Ok(obj) => Ok(Self::storage_node_from(&obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeState;

    fn msn(name: &str, status: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "openebs.io/v1alpha1",
            "kind": "MayastorNode",
            "metadata": { "name": name, "namespace": "mayastor" },
            "spec": { "grpcEndpoint": "10.0.0.2:10124" },
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn test_storage_node_string_status() {
        let node = CrdControlPlane::storage_node_from(&msn("node-1", json!("online"))).unwrap();
        assert_eq!(node.name, "node-1");
        assert_eq!(node.state, NodeState::Online);

        let node = CrdControlPlane::storage_node_from(&msn("node-2", json!("offline"))).unwrap();
        assert_eq!(node.state, NodeState::Offline);
    }

    #[test]
    fn test_storage_node_non_string_status_is_unknown() {
        let node =
            CrdControlPlane::storage_node_from(&msn("node-1", json!({ "state": "online" })))
                .unwrap();
        assert_eq!(node.state, NodeState::Unknown);
    }
}
