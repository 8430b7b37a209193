//! Data Integrity Verification
//!
//! fio write/verify workloads inside application pods, and direct replica
//! checksums over NVMe-oF.

mod fio;
mod verifier;

pub use fio::{is_verify_failure, ChecksumAlgorithm, FioJob, FioPhase, ThinkTime};
pub use verifier::{nqn_from_uri, DataIntegrityVerifier, ReplicaTarget};
