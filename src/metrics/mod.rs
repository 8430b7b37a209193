//! Harness metrics
//!
//! Prometheus counters and histograms describing what a run waited for and
//! what it broke. The registry is owned by the caller so that tests can use a
//! private one and the binary can expose its registry on `/metrics`.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::error::{Error, Result};

/// Metrics recorded by the waiter, the fault injector and the verifier.
#[derive(Clone)]
pub struct SentinelMetrics {
    registry: Registry,
    wait_polls: IntCounter,
    wait_timeouts: IntCounter,
    wait_duration: Histogram,
    faults_injected: IntCounterVec,
    fault_failures: IntCounterVec,
    integrity_violations: IntCounter,
}

impl std::fmt::Debug for SentinelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelMetrics").finish_non_exhaustive()
    }
}

impl SentinelMetrics {
    /// Create the metric set and register it with `registry`.
    pub fn new(registry: Registry) -> Result<Self> {
        let wait_polls = IntCounter::new(
            "replica_sentinel_wait_polls_total",
            "Total number of state polls issued by waiters",
        )?;
        let wait_timeouts = IntCounter::new(
            "replica_sentinel_wait_timeouts_total",
            "Total number of waits that ran out of budget",
        )?;
        let wait_duration = Histogram::with_opts(
            HistogramOpts::new(
                "replica_sentinel_wait_duration_seconds",
                "Time spent waiting for a condition",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        let faults_injected = IntCounterVec::new(
            Opts::new(
                "replica_sentinel_faults_injected_total",
                "Total number of faults applied",
            ),
            &["fault"],
        )?;
        let fault_failures = IntCounterVec::new(
            Opts::new(
                "replica_sentinel_fault_failures_total",
                "Total number of faults that could not be applied",
            ),
            &["fault"],
        )?;
        let integrity_violations = IntCounter::new(
            "replica_sentinel_integrity_violations_total",
            "Total number of data integrity violations detected",
        )?;

        registry.register(Box::new(wait_polls.clone()))?;
        registry.register(Box::new(wait_timeouts.clone()))?;
        registry.register(Box::new(wait_duration.clone()))?;
        registry.register(Box::new(faults_injected.clone()))?;
        registry.register(Box::new(fault_failures.clone()))?;
        registry.register(Box::new(integrity_violations.clone()))?;

        Ok(Self {
            registry,
            wait_polls,
            wait_timeouts,
            wait_duration,
            faults_injected,
            fault_failures,
            integrity_violations,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_poll(&self) {
        self.wait_polls.inc();
    }

    pub fn record_wait(&self, waited: Duration, timed_out: bool) {
        self.wait_duration.observe(waited.as_secs_f64());
        if timed_out {
            self.wait_timeouts.inc();
        }
    }

    pub fn record_fault(&self, fault: &str) {
        self.faults_injected.with_label_values(&[fault]).inc();
    }

    pub fn record_fault_failure(&self, fault: &str) {
        self.fault_failures.with_label_values(&[fault]).inc();
    }

    pub fn record_integrity_violation(&self) {
        self.integrity_violations.inc();
    }

    pub fn polls(&self) -> u64 {
        self.wait_polls.get()
    }

    pub fn timeouts(&self) -> u64 {
        self.wait_timeouts.get()
    }

    pub fn faults(&self, fault: &str) -> u64 {
        self.faults_injected.with_label_values(&[fault]).get()
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let metrics = SentinelMetrics::new(Registry::new()).unwrap();
        metrics.record_poll();
        metrics.record_poll();
        metrics.record_wait(Duration::from_secs(3), true);
        metrics.record_fault("power-off");

        assert_eq!(metrics.polls(), 2);
        assert_eq!(metrics.timeouts(), 1);
        assert_eq!(metrics.faults("power-off"), 1);
        assert_eq!(metrics.faults("remove-replica"), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = SentinelMetrics::new(Registry::new()).unwrap();
        metrics.record_integrity_violation();
        metrics.record_fault_failure("ungraceful-reboot");

        let text = metrics.encode().unwrap();
        assert!(text.contains("replica_sentinel_integrity_violations_total 1"));
        assert!(text.contains("replica_sentinel_fault_failures_total"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = SentinelMetrics::new(registry.clone()).unwrap();
        assert!(SentinelMetrics::new(registry).is_err());
    }
}
