//! Domain Events
//!
//! Immutable records of what the harness did to the cluster and what it saw
//! in return. Events are published through the
//! [`EventPublisher`](super::ports::EventPublisher) port and are used for the
//! scenario audit trail and for asserting behaviour in tests.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::fault_injected("remove-replica", "vol-123");
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Domain event representing a significant occurrence during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Fault Events
    // =========================================================================
    /// A fault was applied to the cluster.
    FaultInjected {
        fault: String,
        target: String,
        timestamp: DateTime<Utc>,
    },

    /// A fault could not be applied.
    FaultFailed {
        fault: String,
        target: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The desired replica count of a volume was changed.
    ReplicaCountChanged {
        volume_id: String,
        from: u32,
        to: u32,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Observation Events
    // =========================================================================
    /// A waited-for condition was observed.
    StateReached {
        volume_id: String,
        condition: String,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A waited-for condition was not observed within its budget.
    WaitTimedOut {
        volume_id: String,
        condition: String,
        last_observed: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Integrity Events
    // =========================================================================
    /// An fio workload finished successfully.
    WorkloadCompleted {
        pod: String,
        phase: String,
        algorithm: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Data read back did not match what was written.
    IntegrityViolation {
        target: String,
        algorithm: String,
        detail: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Pool Events
    // =========================================================================
    /// A pool was created.
    PoolCreated {
        pool: String,
        node: String,
        timestamp: DateTime<Utc>,
    },

    /// A pool was deleted.
    PoolDeleted {
        pool: String,
        timestamp: DateTime<Utc>,
    },

    /// Configured pools were restored.
    PoolsRestored {
        created: usize,
        deleted: usize,
        unchanged: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Scenario Events
    // =========================================================================
    /// A scenario finished.
    ScenarioCompleted {
        scenario: String,
        passed: bool,
        duration_ms: u64,
        detail: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::FaultInjected { timestamp, .. }
            | DomainEvent::FaultFailed { timestamp, .. }
            | DomainEvent::ReplicaCountChanged { timestamp, .. }
            | DomainEvent::StateReached { timestamp, .. }
            | DomainEvent::WaitTimedOut { timestamp, .. }
            | DomainEvent::WorkloadCompleted { timestamp, .. }
            | DomainEvent::IntegrityViolation { timestamp, .. }
            | DomainEvent::PoolCreated { timestamp, .. }
            | DomainEvent::PoolDeleted { timestamp, .. }
            | DomainEvent::PoolsRestored { timestamp, .. }
            | DomainEvent::ScenarioCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::FaultInjected { .. } => "FaultInjected",
            DomainEvent::FaultFailed { .. } => "FaultFailed",
            DomainEvent::ReplicaCountChanged { .. } => "ReplicaCountChanged",
            DomainEvent::StateReached { .. } => "StateReached",
            DomainEvent::WaitTimedOut { .. } => "WaitTimedOut",
            DomainEvent::WorkloadCompleted { .. } => "WorkloadCompleted",
            DomainEvent::IntegrityViolation { .. } => "IntegrityViolation",
            DomainEvent::PoolCreated { .. } => "PoolCreated",
            DomainEvent::PoolDeleted { .. } => "PoolDeleted",
            DomainEvent::PoolsRestored { .. } => "PoolsRestored",
            DomainEvent::ScenarioCompleted { .. } => "ScenarioCompleted",
        }
    }

    /// Get the volume ID if applicable.
    pub fn volume_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ReplicaCountChanged { volume_id, .. }
            | DomainEvent::StateReached { volume_id, .. }
            | DomainEvent::WaitTimedOut { volume_id, .. } => Some(volume_id),
            _ => None,
        }
    }

    /// Whether the event records something going wrong: a fault that could not
    /// be applied, a wait that gave up, corrupted data or a failed scenario.
    pub fn is_failure(&self) -> bool {
        match self {
            DomainEvent::FaultFailed { .. }
            | DomainEvent::WaitTimedOut { .. }
            | DomainEvent::IntegrityViolation { .. } => true,
            DomainEvent::ScenarioCompleted { passed, .. } => !passed,
            _ => false,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    pub fn fault_injected(fault: impl Into<String>, target: impl Into<String>) -> Self {
        DomainEvent::FaultInjected {
            fault: fault.into(),
            target: target.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn fault_failed(
        fault: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::FaultFailed {
            fault: fault.into(),
            target: target.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn replica_count_changed(volume_id: impl Into<String>, from: u32, to: u32) -> Self {
        DomainEvent::ReplicaCountChanged {
            volume_id: volume_id.into(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    pub fn state_reached(
        volume_id: impl Into<String>,
        condition: impl Into<String>,
        waited: Duration,
    ) -> Self {
        DomainEvent::StateReached {
            volume_id: volume_id.into(),
            condition: condition.into(),
            waited_ms: waited.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn wait_timed_out(
        volume_id: impl Into<String>,
        condition: impl Into<String>,
        last_observed: impl Into<String>,
    ) -> Self {
        DomainEvent::WaitTimedOut {
            volume_id: volume_id.into(),
            condition: condition.into(),
            last_observed: last_observed.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn workload_completed(
        pod: impl Into<String>,
        phase: impl Into<String>,
        algorithm: impl Into<String>,
        duration: Duration,
    ) -> Self {
        DomainEvent::WorkloadCompleted {
            pod: pod.into(),
            phase: phase.into(),
            algorithm: algorithm.into(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn integrity_violation(
        target: impl Into<String>,
        algorithm: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        DomainEvent::IntegrityViolation {
            target: target.into(),
            algorithm: algorithm.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pool_created(pool: impl Into<String>, node: impl Into<String>) -> Self {
        DomainEvent::PoolCreated {
            pool: pool.into(),
            node: node.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pool_deleted(pool: impl Into<String>) -> Self {
        DomainEvent::PoolDeleted {
            pool: pool.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn pools_restored(created: usize, deleted: usize, unchanged: usize) -> Self {
        DomainEvent::PoolsRestored {
            created,
            deleted,
            unchanged,
            timestamp: Utc::now(),
        }
    }

    pub fn scenario_completed(
        scenario: impl Into<String>,
        passed: bool,
        duration: Duration,
        detail: Option<String>,
    ) -> Self {
        DomainEvent::ScenarioCompleted {
            scenario: scenario.into(),
            passed,
            duration_ms: duration.as_millis() as u64,
            detail,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = DomainEvent::fault_injected("remove-replica", "vol-123");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("FaultInjected"));
        assert!(json.contains("vol-123"));

        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "FaultInjected");
    }

    #[test]
    fn test_event_type() {
        let event = DomainEvent::wait_timed_out("vol-123", "nexus Online", "Degraded");
        assert_eq!(event.event_type(), "WaitTimedOut");
    }

    #[test]
    fn test_volume_id_extraction() {
        let event = DomainEvent::replica_count_changed("vol-456", 1, 3);
        assert_eq!(event.volume_id(), Some("vol-456"));

        let event = DomainEvent::pool_deleted("pool-on-node-1");
        assert_eq!(event.volume_id(), None);
    }

    #[test]
    fn test_timestamp() {
        let before = Utc::now();
        let event = DomainEvent::pool_created("pool-on-node-1", "node-1");
        let after = Utc::now();

        assert!(event.timestamp() >= before);
        assert!(event.timestamp() <= after);
    }

    #[test]
    fn test_state_reached_records_wait() {
        let event =
            DomainEvent::state_reached("vol-123", "child count 3", Duration::from_millis(1500));
        match event {
            DomainEvent::StateReached { waited_ms, .. } => assert_eq!(waited_ms, 1500),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_failure_classification() {
        assert!(DomainEvent::fault_failed("power-off", "node-1", "api down").is_failure());
        assert!(DomainEvent::integrity_violation("fio-app", "md5", "bad magic").is_failure());
        assert!(!DomainEvent::fault_injected("power-off", "node-1").is_failure());

        let passed = DomainEvent::scenario_completed("stale-pool", true, Duration::ZERO, None);
        let failed = DomainEvent::scenario_completed("stale-pool", false, Duration::ZERO, None);
        assert!(!passed.is_failure());
        assert!(failed.is_failure());
    }

    #[test]
    fn test_scenario_completed() {
        let event = DomainEvent::scenario_completed(
            "checksum-continuity",
            false,
            Duration::from_secs(60),
            Some("verify failed".into()),
        );
        assert_eq!(event.event_type(), "ScenarioCompleted");
    }
}
