//! Domain Layer
//!
//! The domain layer holds the storage model the harness reasons about and the
//! ports through which it reaches the cluster.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external collaborators
//! - **Events** (`events.rs`) - Domain events for the audit trail
//!
//! # Usage
//!
//! ```ignore
//! use replica_sentinel::domain::ports::{ControlPlane, VolumeId};
//!
//! async fn nexus_node(cp: &dyn ControlPlane, id: &VolumeId) -> Result<Option<String>> {
//!     Ok(cp.get_nexus(id).await?.map(|n| n.node))
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    // Port traits
    ClusterObjects,
    ControlPlane,
    EventPublisher,
    NexusControl,
    NodeAgent,
    Platform,
    PodExec,
    // Value objects
    Child,
    ChildState,
    ControlPlaneVersion,
    ExecOutput,
    Nexus,
    NexusState,
    NodeLocation,
    NodeState,
    Pool,
    PoolState,
    PowerState,
    Replica,
    StateTokens,
    StorageNode,
    Volume,
    VolumeId,
    VolumeState,
};
