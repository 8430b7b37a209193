//! Replica Sentinel - Replicated Volume Consistency Harness
//!
//! A client-side tracker and verifier for replicated block volumes on a
//! Mayastor cluster. It observes volume, nexus, replica and pool state
//! through the storage control plane, injects faults (replica removal,
//! engine suppression, power loss, network partitions), and checks that
//! data survives the resulting rebuilds.
//!
//! # Architecture
//!
//! The harness follows an "Observe, Disturb, Verify" pattern:
//!
//! ```text
//! Observer (Eyes) → Fault Injector (Hands) → Integrity Verifier (Judge)
//! ```
//!
//! Scenarios compose the three against one volume or pool and report the
//! steps they completed.
//!
//! # Control Planes
//!
//! - 0.8.x: state in `openebs.io/v1alpha1` custom resources
//! - 1.x: REST API on every node, pools through `DiskPool` resources
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - Run configuration and timeouts
//! - [`crd`] - Custom Resource Definitions for Kubernetes
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`fault`] - Fault injection
//! - [`integrity`] - fio workloads and replica checksums
//! - [`metrics`] - Prometheus metrics
//! - [`observer`] - State snapshots, polling and placement checks
//! - [`pools`] - Pool restore and lifecycle waits
//! - [`scenario`] - End-to-end fault scenarios

pub mod adapters;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod fault;
pub mod integrity;
pub mod metrics;
pub mod observer;
pub mod pools;
pub mod scenario;

// Re-export commonly used types
pub use config::SentinelConfig;
pub use error::{Error, Result};
pub use fault::{FaultHandle, FaultInjector};
pub use integrity::DataIntegrityVerifier;
pub use observer::{PollingWaiter, ReplicaPlacementReconciler, StateSnapshotSource, VolumeStateTracker};
pub use pools::PoolReconciler;
pub use scenario::{run_scenario, ClusterPorts, Scenario, ScenarioContext, ScenarioReport};
