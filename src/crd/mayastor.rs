//! Mayastor Custom Resource Definitions
//!
//! Mirrors the custom resources of both control-plane generations:
//!
//! - `MayastorVolume` and `MayastorPool` (`openebs.io/v1alpha1`) carry all
//!   volume and pool state of the 0.8 control plane. Their state fields are
//!   free-form tokens and are decoded through [`StateTokens`].
//! - `DiskPool` (`openebs.io/v1beta2`) is how pools are created and deleted
//!   under the 1.x REST control plane.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::domain::{Child, Nexus, Pool, Replica, StateTokens, Volume, VolumeId};

// =============================================================================
// DiskPool CRD
// =============================================================================

/// DiskPool represents a pool managed by the 1.x pool operator
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1beta2",
    kind = "DiskPool",
    plural = "diskpools",
    status = "DiskPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DiskPoolSpec {
    /// Node on which the pool is located
    pub node: String,

    /// Disks that make up this pool
    pub disks: Vec<String>,
}

/// DiskPool status
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskPoolStatus {
    #[serde(default)]
    pub pool_status: Option<String>,

    #[serde(default)]
    pub available: u64,

    #[serde(default)]
    pub used: u64,

    #[serde(default)]
    pub capacity: u64,
}

impl DiskPool {
    pub fn new_for(name: &str, node: &str, disks: &[String]) -> Self {
        DiskPool::new(
            name,
            DiskPoolSpec {
                node: node.to_string(),
                disks: disks.to_vec(),
            },
        )
    }
}

// =============================================================================
// MayastorVolume CRD
// =============================================================================

/// MayastorVolume represents a volume of the 0.8 control plane
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "MayastorVolume",
    plural = "mayastorvolumes",
    shortname = "msv",
    status = "MayastorVolumeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MayastorVolumeSpec {
    #[serde(default)]
    pub limit_bytes: u64,

    #[serde(default)]
    pub local: bool,

    #[serde(default)]
    pub preferred_nodes: Vec<String>,

    #[serde(default)]
    pub protocol: String,

    /// Desired number of replicas
    #[serde(default = "default_replicas")]
    pub replica_count: u32,

    #[serde(default)]
    pub required_bytes: u64,

    #[serde(default)]
    pub required_nodes: Vec<String>,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MayastorVolumeStatus {
    #[serde(default)]
    pub nexus: Option<NexusStatus>,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub replicas: Vec<ReplicaStatus>,

    #[serde(default)]
    pub size: u64,

    /// Volume state token (`healthy`, `degraded`, ...)
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub target_nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NexusStatus {
    #[serde(default)]
    pub children: Vec<NexusChildStatus>,

    #[serde(default)]
    pub device_uri: String,

    #[serde(default)]
    pub node: String,

    /// Nexus state token (`NEXUS_ONLINE`, ...)
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NexusChildStatus {
    /// Child state token (`CHILD_ONLINE`, ...)
    pub state: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub node: String,

    #[serde(default)]
    pub offline: bool,

    pub pool: String,

    pub uri: String,
}

/// Replica uuid from the `uuid=` query of a replica or child URI, falling
/// back to the last path segment.
pub fn uuid_from_uri(uri: &str) -> String {
    if let Some((_, query)) = uri.split_once('?') {
        if let Some(uuid) = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("uuid="))
        {
            return uuid.to_string();
        }
    }
    let path = uri.split('?').next().unwrap_or(uri);
    let last = path.rsplit('/').next().unwrap_or(path);
    last.rsplit(':').next().unwrap_or(last).to_string()
}

impl ReplicaStatus {
    pub fn to_replica(&self) -> Replica {
        Replica {
            uuid: uuid_from_uri(&self.uri),
            node: self.node.clone(),
            pool: self.pool.clone(),
            uri: self.uri.clone(),
            offline: self.offline,
        }
    }
}

impl MayastorVolume {
    /// Decode into the domain model using `tokens` for state strings.
    pub fn to_volume(&self, tokens: &StateTokens) -> Volume {
        let id = VolumeId::new(self.metadata.name.clone().unwrap_or_default());
        let status = self.status.clone().unwrap_or_default();
        let replicas: Vec<Replica> = status.replicas.iter().map(ReplicaStatus::to_replica).collect();

        let nexus = status
            .nexus
            .as_ref()
            .filter(|n| !n.node.is_empty() || !n.children.is_empty())
            .map(|n| Nexus {
                uuid: id.to_string(),
                node: n.node.clone(),
                state: tokens.nexus_state(&n.state),
                device_uri: n.device_uri.clone(),
                children: n
                    .children
                    .iter()
                    .map(|c| Child {
                        uri: c.uri.clone(),
                        state: tokens.child_state(&c.state),
                        node: child_node(&c.uri, &n.node, &replicas),
                    })
                    .collect(),
            });

        Volume {
            id,
            desired_replicas: self.spec.replica_count,
            state: tokens.volume_state(&status.state),
            size_bytes: status.size,
            target_node: status
                .target_nodes
                .first()
                .cloned()
                .or_else(|| nexus.as_ref().map(|n| n.node.clone()))
                .filter(|n| !n.is_empty()),
            nexus,
            replicas,
        }
    }
}

/// A local `bdev:///` child lives on the nexus node; a remote child shares
/// its URI with the replica behind it.
fn child_node(uri: &str, nexus_node: &str, replicas: &[Replica]) -> Option<String> {
    if uri.starts_with("bdev:///") && !nexus_node.is_empty() {
        return Some(nexus_node.to_string());
    }
    let uuid = uuid_from_uri(uri);
    replicas
        .iter()
        .find(|r| r.uri == uri || r.uuid == uuid)
        .map(|r| r.node.clone())
}

// =============================================================================
// MayastorPool CRD
// =============================================================================

/// MayastorPool represents a pool of the 0.8 control plane
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "MayastorPool",
    plural = "mayastorpools",
    shortname = "msp",
    status = "MayastorPoolStatus",
    namespaced
)]
pub struct MayastorPoolSpec {
    pub disks: Vec<String>,
    pub node: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MayastorPoolStatus {
    #[serde(default)]
    pub avail: u64,

    #[serde(default)]
    pub capacity: u64,

    #[serde(default)]
    pub disks: Vec<String>,

    #[serde(default)]
    pub reason: Option<String>,

    /// Pool state token (`online`, ...)
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub used: u64,
}

impl MayastorPool {
    pub fn to_pool(&self, tokens: &StateTokens) -> Pool {
        let status = self.status.clone().unwrap_or_default();
        Pool {
            name: self.metadata.name.clone().unwrap_or_default(),
            node: self.spec.node.clone(),
            disks: self.spec.disks.clone(),
            state: tokens.pool_state(&status.state),
            capacity: status.capacity,
            used: status.used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChildState, NexusState, PoolState, VolumeState};

    fn msv_json() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "openebs.io/v1alpha1",
            "kind": "MayastorVolume",
            "metadata": { "name": "vol-1", "namespace": "mayastor" },
            "spec": {
                "limitBytes": 0,
                "local": false,
                "preferredNodes": [],
                "protocol": "nvmf",
                "replicaCount": 2,
                "requiredBytes": 1073741824,
                "requiredNodes": []
            },
            "status": {
                "nexus": {
                    "children": [
                        { "state": "CHILD_ONLINE", "uri": "bdev:///r1?uuid=r1" },
                        { "state": "CHILD_DEGRADED", "uri": "nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:r2" }
                    ],
                    "deviceUri": "nvmf://10.0.0.1:8420/nqn.2019-05.io.openebs:nexus-vol-1",
                    "node": "node-1",
                    "state": "NEXUS_DEGRADED"
                },
                "reason": "",
                "replicas": [
                    { "node": "node-1", "offline": false, "pool": "pool-on-node-1", "uri": "bdev:///r1?uuid=r1" },
                    { "node": "node-2", "offline": false, "pool": "pool-on-node-2", "uri": "nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:r2" }
                ],
                "size": 1073741824,
                "state": "degraded",
                "targetNodes": ["node-1"]
            }
        })
    }

    #[test]
    fn test_decode_v0_volume() {
        let msv: MayastorVolume = serde_json::from_value(msv_json()).unwrap();
        let volume = msv.to_volume(&StateTokens::V0);

        assert_eq!(volume.id.as_str(), "vol-1");
        assert_eq!(volume.desired_replicas, 2);
        assert_eq!(volume.state, VolumeState::Degraded);
        assert_eq!(volume.target_node.as_deref(), Some("node-1"));

        let nexus = volume.nexus.unwrap();
        assert_eq!(nexus.state, NexusState::Degraded);
        assert_eq!(nexus.children[0].state, ChildState::Online);
        assert_eq!(nexus.children[0].node.as_deref(), Some("node-1"));
        assert_eq!(nexus.children[1].node.as_deref(), Some("node-2"));
        assert_eq!(volume.replicas[1].uuid, "r2");
    }

    #[test]
    fn test_unpublished_volume_has_no_nexus() {
        let mut json = msv_json();
        json["status"]["nexus"] = serde_json::json!({});
        json["status"]["targetNodes"] = serde_json::json!([]);
        let msv: MayastorVolume = serde_json::from_value(json).unwrap();
        let volume = msv.to_volume(&StateTokens::V0);
        assert!(volume.nexus.is_none());
        assert!(!volume.is_published());
    }

    #[test]
    fn test_decode_v0_pool() {
        let msp: MayastorPool = serde_json::from_value(serde_json::json!({
            "apiVersion": "openebs.io/v1alpha1",
            "kind": "MayastorPool",
            "metadata": { "name": "pool-on-node-1" },
            "spec": { "disks": ["/dev/sdb"], "node": "node-1" },
            "status": { "avail": 10, "capacity": 20, "disks": ["aio:///dev/sdb"], "state": "online", "used": 10 }
        }))
        .unwrap();
        let pool = msp.to_pool(&StateTokens::V0);
        assert_eq!(pool.state, PoolState::Online);
        assert_eq!(pool.available(), 10);
        assert_eq!(pool.disks, vec!["/dev/sdb"]);
    }

    #[test]
    fn test_uuid_from_uri() {
        assert_eq!(uuid_from_uri("bdev:///abc?uuid=abc"), "abc");
        assert_eq!(
            uuid_from_uri("nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:r2"),
            "r2"
        );
        assert_eq!(uuid_from_uri("nvmf://h:8420/nqn.x:y?foo=1&uuid=z"), "z");
    }
}
