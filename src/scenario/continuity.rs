use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Scenario, ScenarioContext, ScenarioReport};
use crate::config::IntegrityConfig;
use crate::domain::{ClusterObjects, NexusState, VolumeId};
use crate::error::Result;
use crate::integrity::{ChecksumAlgorithm, ThinkTime};

/// Checks that data written while a replica is being re-added survives the
/// rebuild.
///
/// The volume is filled with crc32-tagged blocks, loses a replica, and is
/// then overwritten with md5-tagged blocks while the replica count is
/// restored in the background. A block the rebuild copied from a stale
/// replica still carries its crc32 tag and fails the final md5 verify.
#[derive(Debug, Clone)]
pub struct ChecksumContinuityScenario {
    pub volume_id: VolumeId,
    pub pod: String,
    /// Delay before the replica count is restored
    pub delay: Duration,
    pub think_time: Option<ThinkTime>,
}

impl ChecksumContinuityScenario {
    pub fn new(volume_id: VolumeId, pod: impl Into<String>) -> Self {
        Self {
            volume_id,
            pod: pod.into(),
            delay: Duration::from_secs(10),
            think_time: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = Some(think_time);
        self
    }
}

#[async_trait]
impl Scenario for ChecksumContinuityScenario {
    fn name(&self) -> &'static str {
        "checksum-continuity"
    }

    async fn execute(&self, ctx: &ScenarioContext, report: &mut ScenarioReport) -> Result<()> {
        let id = &self.volume_id;
        let tracker = ctx.tracker(id.clone());
        let volume = ctx.snapshot.volume(id).await?;
        let replicas = volume.desired_replicas;
        let namespace = ctx.config.integrity.app_namespace.as_str();
        let pod = self.pod.as_str();
        let cluster = &ctx.cluster;
        ctx.waiter
            .wait_until(&format!("pod {}/{} running", namespace, pod), || async move {
                cluster.is_pod_running(namespace, pod).await
            })
            .await?;
        report.step(format!("pod {} running", pod));

        let verifier = ctx
            .verifier
            .clone()
            .with_fio_timeout(IntegrityConfig::fio_timeout_for_volume(
                volume.size_bytes >> 20,
            ));

        verifier
            .run_write_workload(&self.pod, ChecksumAlgorithm::Crc32, None)
            .await?;
        report.step("wrote crc32-tagged blocks");

        ctx.faults.remove_replica(id, None).await?;
        tracker
            .wait_for_replica_count(replicas as usize - 1, ctx.wait_timeout())
            .await?;
        report.step(format!("replica count lowered to {}", replicas - 1));

        verifier
            .run_verify_workload(&self.pod, ChecksumAlgorithm::Crc32)
            .await?;
        report.step("crc32 verify passed on reduced volume");

        let restore = ctx
            .faults
            .spawn_set_replica_count(id.clone(), replicas, self.delay);
        let written = verifier
            .run_write_workload(&self.pod, ChecksumAlgorithm::Md5, self.think_time)
            .await;
        let restored = restore.join().await;
        if let (Err(_), Err(e)) = (&written, &restored) {
            warn!(error = %e, "replica restore also failed");
        }
        written?;
        restored?;
        report.step(format!("wrote md5-tagged blocks while restoring {} replicas", replicas));

        tracker
            .wait_for_child_count(replicas as usize, ctx.wait_timeout())
            .await?;
        tracker.wait_for_children_online(ctx.rebuild_timeout()).await?;
        tracker
            .wait_for_nexus_state(NexusState::Online, ctx.rebuild_timeout())
            .await?;
        report.step("rebuild finished");

        verifier
            .run_verify_workload(&self.pod, ChecksumAlgorithm::Md5)
            .await?;
        report.step("md5 verify passed after rebuild");
        Ok(())
    }
}
