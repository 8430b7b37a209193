//! Error types for Replica Sentinel

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while observing or disturbing a storage cluster
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Polling
    // =========================================================================
    /// A polled condition was not met within its budget
    #[error("timed out after {waited:?} waiting for {what} (last observed: {last_observed})")]
    Timeout {
        what: String,
        waited: Duration,
        last_observed: String,
    },

    // =========================================================================
    // Transport / Collaborator Errors
    // =========================================================================
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// HTTP transport error talking to the control plane or node agent
    #[error("HTTP transport error: {0}")]
    Http(#[source] reqwest::Error),

    /// Control plane answered with a non-success status
    #[error("Control plane returned {status}: {message}")]
    ControlPlane { status: u16, message: String },

    /// Control plane response could not be decoded
    #[error("Failed to parse control plane response: {0}")]
    ResponseParse(String),

    /// Object does not exist
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// e2e node agent failure
    #[error("Node agent on {node} failed: {reason}")]
    Agent { node: String, reason: String },

    /// Cloud platform failure
    #[error("Platform operation on {node} failed: {reason}")]
    Platform { node: String, reason: String },

    /// Command executed in a pod or on a host failed
    #[error("Command '{command}' failed: {output}")]
    Exec { command: String, output: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Scenario Failures
    // =========================================================================
    /// Stored data did not match its checksum, or replicas diverged
    #[error("Data integrity violation on {target} ({algorithm}): {detail}")]
    DataIntegrity {
        target: String,
        algorithm: String,
        detail: String,
    },

    /// Replicas are not where they are expected to be
    #[error("Replica placement check failed for {volume}: {detail}")]
    Placement { volume: String, detail: String },

    /// A requested fault could not be applied
    #[error("Fault injection '{fault}' failed: {reason}")]
    FaultInjection { fault: String, reason: String },

    /// A background task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),

    // =========================================================================
    // Configuration
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for a fault injection failure.
    pub fn fault(fault: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::FaultInjection {
            fault: fault.into(),
            reason: reason.to_string(),
        }
    }

    /// True if a polling budget ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True if the object did not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::ControlPlane { status, .. } => *status == 404,
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// True if the control plane itself timed the request out.
    ///
    /// Distinct from [`Error::is_timeout`], which is a client-side polling budget.
    pub fn is_request_timeout(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout(),
            Error::ControlPlane { status, message } => {
                *status == 408
                    || message.contains("Request Timeout")
                    || message.contains("request timed out")
            }
            _ => false,
        }
    }

    /// True for failures of a collaborator rather than of the system under test.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Http(_)
                | Error::ControlPlane { .. }
                | Error::ResponseParse(_)
                | Error::Agent { .. }
                | Error::Platform { .. }
        )
    }

    /// Short stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Timeout { .. } => "timeout",
            Error::Kube(_) => "kube",
            Error::Http(_) => "http",
            Error::ControlPlane { .. } => "control_plane",
            Error::ResponseParse(_) => "response_parse",
            Error::NotFound { .. } => "not_found",
            Error::Agent { .. } => "agent",
            Error::Platform { .. } => "platform",
            Error::Exec { .. } => "exec",
            Error::Io(_) => "io",
            Error::DataIntegrity { .. } => "data_integrity",
            Error::Placement { .. } => "placement",
            Error::FaultInjection { .. } => "fault_injection",
            Error::Task(_) => "task",
            Error::Config(_) => "config",
            Error::Yaml(_) => "yaml",
            Error::Metrics(_) => "metrics",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_target() {
        let err = Error::Timeout {
            what: "nexus state of vol-1".to_string(),
            waited: Duration::from_secs(30),
            last_observed: "Degraded".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.starts_with("timed out after 30s waiting for nexus state of vol-1"));
        assert!(msg.contains("30s"));
        assert!(msg.contains("Degraded"));
        assert!(err.is_timeout());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::not_found("pool", "pool-on-node-1").is_not_found());
        assert!(Error::ControlPlane {
            status: 404,
            message: "gone".into()
        }
        .is_not_found());
        assert!(!Error::Internal("x".into()).is_not_found());
    }

    #[test]
    fn test_request_timeout_detection() {
        let err = Error::ControlPlane {
            status: 500,
            message: "upstream: request timed out".into(),
        };
        assert!(err.is_request_timeout());
        assert!(!err.is_timeout());

        let err = Error::ControlPlane {
            status: 408,
            message: String::new(),
        };
        assert!(err.is_request_timeout());

        let err = Error::ControlPlane {
            status: 500,
            message: "boom".into(),
        };
        assert!(!err.is_request_timeout());
    }

    #[test]
    fn test_fault_helper() {
        let err = Error::fault("power-off node-2", "no platform configured");
        assert_eq!(err.kind(), "fault_injection");
        assert_eq!(
            err.to_string(),
            "Fault injection 'power-off node-2' failed: no platform configured"
        );
    }
}
