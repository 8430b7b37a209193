use async_trait::async_trait;

use super::{Scenario, ScenarioContext, ScenarioReport};
use crate::domain::{ChildState, NexusState, VolumeId};
use crate::error::{Error, Result};

/// Repeatedly grows a volume to `target_replicas` and follows the rebuild of
/// the new children, optionally shrinking back in between.
#[derive(Debug, Clone)]
pub struct ReplicaRebuildScenario {
    pub volume_id: VolumeId,
    pub base_replicas: u32,
    pub target_replicas: u32,
    pub cycles: usize,
    pub scale_down: bool,
}

impl ReplicaRebuildScenario {
    pub const DEFAULT_CYCLES: usize = 2;

    pub fn new(volume_id: VolumeId, target_replicas: u32) -> Self {
        Self {
            volume_id,
            base_replicas: 1,
            target_replicas,
            cycles: Self::DEFAULT_CYCLES,
            scale_down: true,
        }
    }

    pub fn with_base_replicas(mut self, base_replicas: u32) -> Self {
        self.base_replicas = base_replicas;
        self
    }

    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn without_scale_down(mut self) -> Self {
        self.scale_down = false;
        self
    }
}

#[async_trait]
impl Scenario for ReplicaRebuildScenario {
    fn name(&self) -> &'static str {
        "replica-rebuild"
    }

    async fn execute(&self, ctx: &ScenarioContext, report: &mut ScenarioReport) -> Result<()> {
        if self.target_replicas <= self.base_replicas {
            return Err(Error::Config(format!(
                "target replica count {} must exceed base count {}",
                self.target_replicas, self.base_replicas
            )));
        }
        if self.cycles > 1 && !self.scale_down {
            return Err(Error::Config(
                "repeated rebuild cycles need scale-down between them".into(),
            ));
        }

        let id = &self.volume_id;
        let tracker = ctx.tracker(id.clone());
        let base = self.base_replicas as usize;
        let target = self.target_replicas as usize;

        let snapshot = &ctx.snapshot;
        ctx.waiter
            .wait_until(&format!("volume {} published", id), || async move {
                snapshot.is_published(id).await
            })
            .await?;
        tracker
            .wait_for_replica_count(base, ctx.wait_timeout())
            .await?;
        report.step(format!("volume published with {} replica(s)", base));

        for cycle in 1..=self.cycles {
            ctx.faults.set_replica_count(id, self.target_replicas).await?;
            tracker
                .wait_for_replica_count(target, ctx.wait_timeout())
                .await?;
            tracker
                .wait_for_child_count(target, ctx.wait_timeout())
                .await?;
            report.step(format!("cycle {}: scaled to {} replicas", cycle, target));

            let took = tracker
                .wait_for_rebuild(target - 1, ctx.rebuild_timeout())
                .await?;
            report.step(format!("cycle {}: rebuild finished in {:?}", cycle, took));

            let unhealthy = ctx.placement.replicas_on_unhealthy_pools(id).await?;
            if !unhealthy.is_empty() {
                return Err(Error::Placement {
                    volume: id.to_string(),
                    detail: format!("replicas on nodes without an online pool: {:?}", unhealthy),
                });
            }

            if self.scale_down {
                ctx.faults.set_replica_count(id, self.base_replicas).await?;
                tracker
                    .wait_for_replica_count(base, ctx.wait_timeout())
                    .await?;
                tracker
                    .wait_for_child_state(0, ChildState::Online, ctx.wait_timeout())
                    .await?;
                tracker
                    .wait_for_nexus_state(NexusState::Online, ctx.wait_timeout())
                    .await?;
                report.step(format!("cycle {}: scaled back to {} replica(s)", cycle, base));
            }
        }
        Ok(())
    }
}
