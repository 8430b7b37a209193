//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ControlPlane │ NexusControl │ ClusterObjects │ PodExec    │ │
//! │  │  NodeAgent │ Platform │ EventPublisher                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ ControlPlaneClient (CrdControlPlane │ RestControlPlane)    │ │
//! │  │ KubeCluster │ KubectlExec │ E2eAgentClient │ HcloudPlatform │ │
//! │  │ LoggingEventPublisher │ InMemoryCluster                    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use replica_sentinel::adapters::{ControlPlaneClient, KubeCluster};
//! use replica_sentinel::domain::ports::ControlPlane;
//!
//! let cp = ControlPlaneClient::from_config(client.clone(), &config)?;
//! let nexus = cp.get_nexus(&volume_id).await?;
//! ```

mod control_plane;
mod crd_control_plane;
mod e2e_agent;
mod hcloud;
pub mod in_memory;
mod kubectl;
mod kubernetes;
mod rest_control_plane;

pub use control_plane::ControlPlaneClient;
pub use crd_control_plane::CrdControlPlane;
pub use e2e_agent::E2eAgentClient;
pub use hcloud::HcloudPlatform;
pub use in_memory::InMemoryCluster;
pub use kubectl::KubectlExec;
pub use kubernetes::KubeCluster;
pub use rest_control_plane::RestControlPlane;

// Re-export event publishers for convenience
mod event_publisher;
pub use event_publisher::{CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher};
