//! Fault Scenarios
//!
//! A scenario drives one fault sequence against an already provisioned
//! volume or pool and checks the cluster's response. Scenarios receive every
//! collaborator through a [`ScenarioContext`] and never construct clients
//! themselves, so the same scenario runs against a live cluster or the
//! in-memory fake.
//!
//! # Reporting
//!
//! [`run_scenario`] never fails. Any error from the scenario body ends up in
//! the returned [`ScenarioReport`] together with the steps completed so far,
//! and a `ScenarioCompleted` event is published either way.

mod continuity;
mod pool;
mod rebuild;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SentinelConfig;
use crate::domain::{
    ClusterObjects, ControlPlane, DomainEvent, EventPublisher, NexusControl, NodeAgent, PodExec,
    Platform, VolumeId,
};
use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::integrity::DataIntegrityVerifier;
use crate::metrics::SentinelMetrics;
use crate::observer::{
    PollingWaiter, ReplicaPlacementReconciler, StateSnapshotSource, VolumeStateTracker,
};
use crate::pools::PoolReconciler;

pub use continuity::ChecksumContinuityScenario;
pub use pool::{PoolRecreateScenario, StalePoolScenario};
pub use rebuild::ReplicaRebuildScenario;

// =============================================================================
// Ports
// =============================================================================

/// Every external collaborator a scenario may touch.
#[derive(Clone)]
pub struct ClusterPorts {
    pub control_plane: Arc<dyn ControlPlane>,
    pub nexus: Arc<dyn NexusControl>,
    pub cluster: Arc<dyn ClusterObjects>,
    pub exec: Arc<dyn PodExec>,
    pub agent: Arc<dyn NodeAgent>,
    pub platform: Option<Arc<dyn Platform>>,
}

// =============================================================================
// Context
// =============================================================================

/// Components shared by all scenarios of a run.
#[derive(Clone)]
pub struct ScenarioContext {
    pub snapshot: StateSnapshotSource,
    pub waiter: PollingWaiter,
    pub faults: FaultInjector,
    pub verifier: DataIntegrityVerifier,
    pub placement: ReplicaPlacementReconciler,
    pub pools: PoolReconciler,
    pub cluster: Arc<dyn ClusterObjects>,
    pub events: Arc<dyn EventPublisher>,
    pub config: SentinelConfig,
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("waiter", &self.waiter)
            .field("faults", &self.faults)
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl ScenarioContext {
    pub fn new(
        ports: ClusterPorts,
        config: SentinelConfig,
        events: Arc<dyn EventPublisher>,
        metrics: Option<SentinelMetrics>,
    ) -> Self {
        let snapshot = StateSnapshotSource::new(ports.control_plane.clone());
        let mut waiter = PollingWaiter::from_config(&config.wait);
        let mut faults = FaultInjector::new(
            ports.control_plane.clone(),
            ports.nexus,
            ports.cluster.clone(),
            ports.agent.clone(),
            events.clone(),
            config.faults.clone(),
        );
        if let Some(platform) = ports.platform {
            faults = faults.with_platform(platform);
        }
        let mut verifier =
            DataIntegrityVerifier::new(ports.exec, ports.agent, events.clone(), &config.integrity);
        let mut pools = PoolReconciler::new(
            ports.control_plane,
            ports.cluster.clone(),
            events.clone(),
            config.pools.clone(),
        );
        if let Some(metrics) = metrics {
            waiter = waiter.with_metrics(metrics.clone());
            faults = faults.with_metrics(metrics.clone());
            verifier = verifier.with_metrics(metrics.clone());
            pools = pools.with_metrics(metrics);
        }

        Self {
            placement: ReplicaPlacementReconciler::new(snapshot.clone()),
            snapshot,
            waiter,
            faults,
            verifier,
            pools,
            cluster: ports.cluster,
            events,
            config,
        }
    }

    /// Tracker for `volume_id` sharing this context's waiter and events.
    pub fn tracker(&self, volume_id: VolumeId) -> VolumeStateTracker {
        VolumeStateTracker::new(
            volume_id,
            self.snapshot.clone(),
            self.waiter.clone(),
            self.events.clone(),
        )
    }

    pub fn wait_timeout(&self) -> Duration {
        self.config.wait.timeout()
    }

    pub fn rebuild_timeout(&self) -> Duration {
        self.config.wait.rebuild_timeout()
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub duration: Duration,
    pub steps: Vec<String>,
    pub error: Option<Error>,
}

impl ScenarioReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            duration: Duration::ZERO,
            steps: Vec::new(),
            error: None,
        }
    }

    /// Record a completed step.
    pub fn step(&mut self, step: impl Into<String>) {
        let step = step.into();
        info!(scenario = %self.name, %step, "step complete");
        self.steps.push(step);
    }

    fn finish(&mut self, duration: Duration, error: Option<Error>) {
        self.duration = duration;
        self.passed = error.is_none();
        self.error = error;
    }

    /// The report on success, the scenario's error otherwise.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    /// One-line summary for terminal output.
    pub fn summary(&self) -> String {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        match &self.error {
            Some(e) => format!(
                "{} {} after {:?} ({} steps): {}",
                verdict,
                self.name,
                self.duration,
                self.steps.len(),
                e
            ),
            None => format!(
                "{} {} in {:?} ({} steps)",
                verdict,
                self.name,
                self.duration,
                self.steps.len()
            ),
        }
    }
}

// =============================================================================
// Scenario Trait
// =============================================================================

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scenario body. Completed steps are recorded in `report` as they pass.
    async fn execute(&self, ctx: &ScenarioContext, report: &mut ScenarioReport) -> Result<()>;
}

/// Run `scenario` to completion and report its outcome.
pub async fn run_scenario(scenario: &dyn Scenario, ctx: &ScenarioContext) -> ScenarioReport {
    let started = Instant::now();
    let mut report = ScenarioReport::new(scenario.name());
    let outcome = scenario
        .execute(ctx, &mut report)
        .instrument(info_span!("scenario", name = scenario.name()))
        .await;

    report.finish(started.elapsed(), outcome.err());
    match &report.error {
        None => info!(scenario = %report.name, duration = ?report.duration, "scenario passed"),
        Some(e) => warn!(scenario = %report.name, error = %e, "scenario failed"),
    }

    let event = DomainEvent::scenario_completed(
        report.name.clone(),
        report.passed,
        report.duration,
        report.error.as_ref().map(ToString::to_string),
    );
    if let Err(e) = ctx.events.publish(event).await {
        warn!(error = %e, "failed to publish scenario outcome");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryEventCollector};

    struct Failing;

    #[async_trait]
    impl Scenario for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _: &ScenarioContext, report: &mut ScenarioReport) -> Result<()> {
            report.step("first step");
            Err(Error::Internal("second step broke".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_scenario_keeps_steps_and_error() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let events = Arc::new(InMemoryEventCollector::new());
        let ctx = ScenarioContext::new(cluster.ports(), SentinelConfig::default(), events.clone(), None);

        let report = run_scenario(&Failing, &ctx).await;

        assert!(!report.passed);
        assert_eq!(report.steps, vec!["first step"]);
        assert!(report.summary().starts_with("FAIL failing"));
        assert_eq!(events.events_of_type("ScenarioCompleted").len(), 1);
        assert!(report.into_result().is_err());
    }
}
