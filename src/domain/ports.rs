//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the abstractions (ports) that the observer, fault and
//! integrity layers depend on. Infrastructure adapters implement these traits
//! against a real cluster; the in-memory adapter implements them for tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ControlPlane │ ClusterObjects │ PodExec │ NodeAgent │    │
//! │  │  Platform │ NexusControl │ EventPublisher           │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  CrdControlPlane │ RestControlPlane │ KubeCluster   │    │
//! │  │  KubectlExec │ E2eAgentClient │ HcloudPlatform      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Volume identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Volume state as reported by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Healthy,
    Degraded,
    Faulted,
    #[default]
    Unknown,
}

/// Nexus state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NexusState {
    Online,
    Degraded,
    Faulted,
    #[default]
    Unknown,
}

/// Nexus child state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildState {
    Online,
    Degraded,
    Faulted,
    #[default]
    Unknown,
}

/// Pool state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolState {
    Online,
    Degraded,
    Faulted,
    Pending,
    Offline,
    #[default]
    Unknown,
}

/// Storage-engine node state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Power state of a machine as seen by the cloud platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Off,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{:?}", self)
                }
            }
        )*
    };
}

display_as_debug!(VolumeState, NexusState, ChildState, PoolState, NodeState, PowerState);

/// A replica as seen through the nexus.
///
/// Children keep the order in which the nexus reports them; a new replica
/// is appended at the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Child {
    pub uri: String,
    pub state: ChildState,
    /// Node hosting the replica behind this child, when it can be resolved
    pub node: Option<String>,
}

impl Child {
    /// Children backed by a replica on the nexus node itself use a bdev URI.
    pub fn is_local(&self) -> bool {
        self.uri.starts_with("bdev:///")
    }
}

/// The I/O front-end of a published volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nexus {
    pub uuid: String,
    pub node: String,
    pub state: NexusState,
    pub device_uri: String,
    pub children: Vec<Child>,
}

/// A data copy of a volume on a specific node and pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub uuid: String,
    pub node: String,
    pub pool: String,
    pub uri: String,
    pub offline: bool,
}

/// A replicated volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub desired_replicas: u32,
    pub state: VolumeState,
    pub size_bytes: u64,
    pub nexus: Option<Nexus>,
    pub replicas: Vec<Replica>,
    /// Node the volume is published on, if any
    pub target_node: Option<String>,
}

impl Volume {
    pub fn is_published(&self) -> bool {
        self.target_node.as_deref().is_some_and(|n| !n.is_empty())
            || self.nexus.as_ref().is_some_and(|n| !n.node.is_empty())
    }

    pub fn replica_nodes(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.node.clone()).collect()
    }
}

/// A disk-backed storage area on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub node: String,
    pub disks: Vec<String>,
    pub state: PoolState,
    pub capacity: u64,
    pub used: u64,
}

impl Pool {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    pub fn is_online(&self) -> bool {
        self.state == PoolState::Online
    }
}

/// A node running the storage engine, as registered with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub name: String,
    pub state: NodeState,
}

/// A Kubernetes node and its role flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub name: String,
    pub ip_address: String,
    /// Labelled to run the storage engine
    pub storage_node: bool,
    pub master_node: bool,
}

/// Output of a command run inside a pod or on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

// =============================================================================
// State Tokens
// =============================================================================

/// Control-plane API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneVersion {
    /// Custom-resource based control plane (0.8.x)
    V0,
    /// REST control plane (1.x)
    V1,
}

impl std::fmt::Display for ControlPlaneVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlPlaneVersion::V0 => write!(f, "0.8.2"),
            ControlPlaneVersion::V1 => write!(f, "1.0.0"),
        }
    }
}

impl std::str::FromStr for ControlPlaneVersion {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "v0" | "0" | "crd" => Ok(ControlPlaneVersion::V0),
            "v1" | "1" | "rest" => Ok(ControlPlaneVersion::V1),
            other => Err(crate::error::Error::Config(format!(
                "unknown control plane version: {}",
                other
            ))),
        }
    }
}

/// The wire tokens a control-plane version uses for each state.
///
/// Adapters parse wire strings through these; nothing outside an adapter
/// compares raw strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTokens {
    pub volume_healthy: &'static str,
    pub volume_degraded: &'static str,
    pub volume_faulted: &'static str,
    pub child_online: &'static str,
    pub child_degraded: &'static str,
    pub child_faulted: &'static str,
    pub child_unknown: &'static str,
    pub nexus_online: &'static str,
    pub nexus_degraded: &'static str,
    pub nexus_faulted: &'static str,
    pub nexus_unknown: &'static str,
    pub pool_online: &'static str,
    pub pool_degraded: &'static str,
    pub pool_faulted: &'static str,
    pub pool_pending: &'static str,
    pub pool_offline: &'static str,
    pub node_online: &'static str,
    pub node_offline: &'static str,
    pub node_unknown: &'static str,
}

impl StateTokens {
    /// Tokens of the custom-resource control plane.
    pub const V0: StateTokens = StateTokens {
        volume_healthy: "healthy",
        volume_degraded: "degraded",
        volume_faulted: "faulted",
        child_online: "CHILD_ONLINE",
        child_degraded: "CHILD_DEGRADED",
        child_faulted: "CHILD_FAULTED",
        child_unknown: "CHILD_UNKNOWN",
        nexus_online: "NEXUS_ONLINE",
        nexus_degraded: "NEXUS_DEGRADED",
        nexus_faulted: "NEXUS_FAULTED",
        nexus_unknown: "NEXUS_UNKNOWN",
        pool_online: "online",
        pool_degraded: "degraded",
        pool_faulted: "faulted",
        pool_pending: "pending",
        pool_offline: "offline",
        node_online: "online",
        node_offline: "offline",
        node_unknown: "unknown",
    };

    /// Tokens of the REST control plane.
    pub const V1: StateTokens = StateTokens {
        volume_healthy: "Online",
        volume_degraded: "Degraded",
        volume_faulted: "Faulted",
        child_online: "Online",
        child_degraded: "Degraded",
        child_faulted: "Faulted",
        child_unknown: "Unknown",
        nexus_online: "Online",
        nexus_degraded: "Degraded",
        nexus_faulted: "Faulted",
        nexus_unknown: "Unknown",
        pool_online: "Online",
        pool_degraded: "Degraded",
        pool_faulted: "Faulted",
        pool_pending: "Pending",
        pool_offline: "Offline",
        node_online: "Online",
        node_offline: "Offline",
        node_unknown: "Unknown",
    };

    pub fn for_version(version: ControlPlaneVersion) -> &'static StateTokens {
        match version {
            ControlPlaneVersion::V0 => &Self::V0,
            ControlPlaneVersion::V1 => &Self::V1,
        }
    }

    pub fn volume_state(&self, token: &str) -> VolumeState {
        match token {
            t if t == self.volume_healthy => VolumeState::Healthy,
            t if t == self.volume_degraded => VolumeState::Degraded,
            t if t == self.volume_faulted => VolumeState::Faulted,
            _ => VolumeState::Unknown,
        }
    }

    pub fn nexus_state(&self, token: &str) -> NexusState {
        match token {
            t if t == self.nexus_online => NexusState::Online,
            t if t == self.nexus_degraded => NexusState::Degraded,
            t if t == self.nexus_faulted => NexusState::Faulted,
            _ => NexusState::Unknown,
        }
    }

    pub fn child_state(&self, token: &str) -> ChildState {
        match token {
            t if t == self.child_online => ChildState::Online,
            t if t == self.child_degraded => ChildState::Degraded,
            t if t == self.child_faulted => ChildState::Faulted,
            _ => ChildState::Unknown,
        }
    }

    pub fn pool_state(&self, token: &str) -> PoolState {
        match token {
            t if t == self.pool_online => PoolState::Online,
            t if t == self.pool_degraded => PoolState::Degraded,
            t if t == self.pool_faulted => PoolState::Faulted,
            t if t == self.pool_pending => PoolState::Pending,
            t if t == self.pool_offline => PoolState::Offline,
            _ => PoolState::Unknown,
        }
    }

    pub fn node_state(&self, token: &str) -> NodeState {
        match token {
            t if t == self.node_online => NodeState::Online,
            t if t == self.node_offline => NodeState::Offline,
            _ => NodeState::Unknown,
        }
    }
}

// =============================================================================
// Control Plane Port
// =============================================================================

/// Port for the storage control plane.
///
/// Every read reflects the current external state; implementations must not
/// cache and must not retry.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// API version served by this client.
    fn version(&self) -> ControlPlaneVersion;

    /// Wire tokens of this version.
    fn tokens(&self) -> &'static StateTokens {
        StateTokens::for_version(self.version())
    }

    /// Get a volume. `None` if it does not exist.
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>>;

    /// List all volumes.
    async fn list_volumes(&self) -> Result<Vec<Volume>>;

    /// Delete a volume.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()>;

    /// Set the desired replica count of a volume.
    async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()>;

    /// Get the nexus of a volume. `None` if the volume is not published.
    async fn get_nexus(&self, volume_id: &VolumeId) -> Result<Option<Nexus>>;

    /// Get the replicas of a volume.
    async fn get_replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>>;

    /// Get a pool. `None` if it does not exist.
    async fn get_pool(&self, name: &str) -> Result<Option<Pool>>;

    /// List all pools.
    async fn list_pools(&self) -> Result<Vec<Pool>>;

    /// Create a pool on a node from the given disks.
    async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()>;

    /// Delete a pool.
    async fn delete_pool(&self, name: &str) -> Result<()>;

    /// List nodes registered with the storage engine.
    async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>>;

    /// Get a storage-engine node. `None` if not registered.
    async fn get_storage_node(&self, name: &str) -> Result<Option<StorageNode>>;
}

// =============================================================================
// Nexus Control Port
// =============================================================================

/// Port for direct manipulation of a nexus.
#[async_trait]
pub trait NexusControl: Send + Sync {
    /// Fault (detach) a child from the nexus so the volume degrades.
    async fn fault_child(&self, nexus: &Nexus, child_uri: &str) -> Result<()>;
}

// =============================================================================
// Cluster Objects Port
// =============================================================================

/// Label that schedules the storage engine onto a node.
pub const ENGINE_LABEL_KEY: &str = "openebs.io/engine";

/// Value of [`ENGINE_LABEL_KEY`] that enables the engine.
pub const ENGINE_LABEL_VALUE: &str = "mayastor";

/// Port for the Kubernetes objects the harness touches.
#[async_trait]
pub trait ClusterObjects: Send + Sync {
    /// All cluster nodes with their addresses and roles.
    async fn node_locations(&self) -> Result<Vec<NodeLocation>>;

    /// Set (`Some`) or remove (`None`) a node label.
    async fn set_node_label(&self, node: &str, key: &str, value: Option<&str>) -> Result<()>;

    /// True if a storage-engine pod is running on the node.
    async fn engine_pod_running_on_node(&self, node: &str) -> Result<bool>;

    /// True if the named pod is in the Running phase.
    async fn is_pod_running(&self, namespace: &str, pod: &str) -> Result<bool>;
}

/// Port for executing commands inside application pods.
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` in `pod`. A non-zero exit is reported in the output, not as an error.
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<ExecOutput>;
}

// =============================================================================
// Node Agent Port
// =============================================================================

/// Port for the privileged per-node e2e agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Crash and reboot the host.
    async fn ungraceful_reboot(&self, node_ip: &str) -> Result<()>;

    /// Drop connections from the given nodes.
    async fn drop_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()>;

    /// Undo [`NodeAgent::drop_connections_from_nodes`].
    async fn accept_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()>;

    /// Check that the agent answers.
    async fn is_reachable(&self, node_ip: &str) -> Result<()>;

    /// Run a shell command on the host and return its output.
    async fn exec(&self, node_ip: &str, command: &str) -> Result<String>;
}

// =============================================================================
// Platform Port
// =============================================================================

/// Port for cloud-provider machine control.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn power_on_node(&self, node: &str) -> Result<()>;

    async fn power_off_node(&self, node: &str) -> Result<()>;

    async fn node_power_state(&self, node: &str) -> Result<PowerState>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}
