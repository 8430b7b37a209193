use async_trait::async_trait;
use uuid::Uuid;

use super::{Scenario, ScenarioContext, ScenarioReport};
use crate::domain::{NodeState, PowerState};
use crate::error::Result;

// =============================================================================
// Pool Recreate
// =============================================================================

/// Drains a pool, deletes it and recreates it on the same node and disks.
#[derive(Debug, Clone)]
pub struct PoolRecreateScenario {
    pub pool: String,
}

impl PoolRecreateScenario {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl Scenario for PoolRecreateScenario {
    fn name(&self) -> &'static str {
        "pool-recreate"
    }

    async fn execute(&self, ctx: &ScenarioContext, report: &mut ScenarioReport) -> Result<()> {
        let name = self.pool.as_str();
        let timeout = ctx.config.pools.create_timeout();
        let old = ctx.snapshot.pool(name).await?;

        let control_plane = ctx.snapshot.control_plane();
        let victims: Vec<_> = control_plane
            .list_volumes()
            .await?
            .into_iter()
            .filter(|v| v.replicas.iter().any(|r| r.pool == name))
            .map(|v| v.id)
            .collect();
        for id in &victims {
            control_plane.delete_volume(id).await?;
            let snapshot = &ctx.snapshot;
            ctx.waiter
                .wait_until(&format!("volume {} deleted", id), || async move {
                    snapshot.is_deleted(id).await
                })
                .await?;
        }
        report.step(format!("deleted {} volume(s) using {}", victims.len(), name));

        ctx.pools.wait_pool_usage_zero(name, timeout).await?;
        report.step("pool usage reached zero");

        ctx.pools.delete_pool(name).await?;
        ctx.pools.wait_pool_deleted(name, timeout).await?;
        report.step("pool deleted");

        ctx.pools.recreate_pool(&old, name).await?;
        ctx.pools.wait_pool_online(name, timeout).await?;
        report.step(format!("pool recreated on {}", old.node));
        Ok(())
    }
}

// =============================================================================
// Stale Pool
// =============================================================================

/// Deletes a pool while its node is powered off, then checks that the
/// deletion completes once the node returns and that its disk can host a new
/// pool.
#[derive(Debug, Clone)]
pub struct StalePoolScenario {
    pub pool: String,
}

impl StalePoolScenario {
    pub fn new(pool: impl Into<String>) -> Self {
        Self { pool: pool.into() }
    }
}

#[async_trait]
impl Scenario for StalePoolScenario {
    fn name(&self) -> &'static str {
        "stale-pool"
    }

    async fn execute(&self, ctx: &ScenarioContext, report: &mut ScenarioReport) -> Result<()> {
        let name = self.pool.as_str();
        let pools = &ctx.config.pools;
        let old = ctx.snapshot.pool(name).await?;
        let node = old.node.as_str();
        let snapshot = &ctx.snapshot;
        let faults = &ctx.faults;

        faults.power_off_node(node).await?;
        ctx.waiter
            .wait_until(&format!("node {} powered off", node), || async move {
                Ok(faults.node_power_state(node).await? == PowerState::Off)
            })
            .await?;
        ctx.waiter
            .wait_until(&format!("storage node {} offline", node), || async move {
                Ok(snapshot.storage_node_state(node).await? != NodeState::Online)
            })
            .await?;
        report.step(format!("powered off {}", node));

        ctx.pools.delete_pool(name).await?;
        report.step("pool deletion requested");

        faults.power_on_node(node).await?;
        ctx.waiter
            .wait_until(&format!("storage node {} online", node), || async move {
                Ok(snapshot.storage_node_state(node).await? == NodeState::Online)
            })
            .await?;
        report.step(format!("powered on {}", node));

        ctx.pools
            .wait_pool_deleted(name, pools.stale_online_timeout())
            .await?;
        report.step("stale pool deleted");

        let suffix = Uuid::new_v4().simple().to_string();
        let new_name = format!("{}-{}", name, &suffix[..8]);
        ctx.pools.recreate_pool(&old, &new_name).await?;
        ctx.pools
            .wait_pool_online_every(
                &new_name,
                pools.stale_online_timeout(),
                pools.stale_online_interval(),
            )
            .await?;
        report.step(format!("pool {} online on the same disk", new_name));

        ctx.pools
            .wait_pools_online(pools.stale_online_timeout())
            .await?;
        report.step("all pools online");
        Ok(())
    }
}
