//! Custom Resource Definitions
//!
//! Storage-system custom resources read and written by the control-plane
//! adapters.

mod mayastor;

pub use mayastor::{
    uuid_from_uri, DiskPool, DiskPoolSpec, DiskPoolStatus, MayastorPool, MayastorPoolSpec,
    MayastorPoolStatus, MayastorVolume, MayastorVolumeSpec, MayastorVolumeStatus,
    NexusChildStatus, NexusStatus, ReplicaStatus,
};
