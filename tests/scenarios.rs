//! End-to-end scenario tests against the in-memory cluster.

use std::sync::Arc;

use assert_matches::assert_matches;
use prometheus::Registry;

use replica_sentinel::adapters::{InMemoryCluster, InMemoryEventCollector};
use replica_sentinel::domain::{ExecOutput, PoolState, VolumeId};
use replica_sentinel::metrics::SentinelMetrics;
use replica_sentinel::scenario::{
    ChecksumContinuityScenario, PoolRecreateScenario, ReplicaRebuildScenario, StalePoolScenario,
};
use replica_sentinel::{run_scenario, Error, ScenarioContext, SentinelConfig};

const NODES: [&str; 3] = ["node-1", "node-2", "node-3"];

/// Three storage nodes, each with its configured pool Online.
fn cluster_with_pools() -> Arc<InMemoryCluster> {
    let cluster = InMemoryCluster::with_nodes(&NODES);
    for node in NODES {
        cluster.add_pool(&format!("pool-on-{}", node), node, "/dev/sdb", PoolState::Online);
    }
    cluster
}

fn context(cluster: &Arc<InMemoryCluster>) -> (ScenarioContext, Arc<InMemoryEventCollector>) {
    let events = Arc::new(InMemoryEventCollector::new());
    let ctx = ScenarioContext::new(
        cluster.ports(),
        SentinelConfig::default(),
        events.clone(),
        None,
    );
    (ctx, events)
}

fn fio_ok() -> ExecOutput {
    ExecOutput {
        success: true,
        exit_code: Some(0),
        output: "benchtest: (groupid=0, jobs=1): err= 0".to_string(),
    }
}

// =============================================================================
// Replica Rebuild
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rebuild_cycles_scale_up_and_back() {
    let cluster = cluster_with_pools();
    let id = cluster.add_volume("vol-1", 1, Some("node-1"));
    let metrics = SentinelMetrics::new(Registry::new()).unwrap();
    let ctx = ScenarioContext::new(
        cluster.ports(),
        SentinelConfig::default(),
        Arc::new(InMemoryEventCollector::new()),
        Some(metrics.clone()),
    );

    let report = run_scenario(&ReplicaRebuildScenario::new(id.clone(), 3), &ctx).await;

    assert!(report.passed, "{}", report.summary());
    assert_eq!(report.steps.len(), 7);
    assert_eq!(report.steps[0], "volume published with 1 replica(s)");
    assert_eq!(report.steps[6], "cycle 2: scaled back to 1 replica(s)");
    assert_eq!(
        cluster.calls_starting_with("set_replica_count"),
        vec![
            "set_replica_count vol-1 3",
            "set_replica_count vol-1 1",
            "set_replica_count vol-1 3",
            "set_replica_count vol-1 1",
        ]
    );
    assert_eq!(metrics.faults("set-replica-count"), 4);

    let volume = cluster.volume(&id).unwrap();
    assert_eq!(volume.replica_nodes(), vec!["node-1".to_string()]);
    assert_eq!(cluster.pool("pool-on-node-2").unwrap().used, 0);
    assert_eq!(cluster.pool("pool-on-node-3").unwrap().used, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rebuild_without_scale_down_keeps_replicas() {
    let cluster = cluster_with_pools();
    let id = cluster.add_volume("vol-1", 1, Some("node-1"));
    let (ctx, _) = context(&cluster);

    let scenario = ReplicaRebuildScenario::new(id.clone(), 2)
        .with_cycles(1)
        .without_scale_down();
    let report = run_scenario(&scenario, &ctx).await;

    assert!(report.passed, "{}", report.summary());
    assert_eq!(report.steps.len(), 3);
    assert_eq!(cluster.volume(&id).unwrap().replicas.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rebuild_of_missing_volume_fails_fast() {
    let cluster = cluster_with_pools();
    let (ctx, events) = context(&cluster);

    let report = run_scenario(&ReplicaRebuildScenario::new(VolumeId::new("ghost"), 2), &ctx).await;

    assert!(report.error.as_ref().is_some_and(Error::is_not_found));
    assert!(report.steps.is_empty());
    assert!(cluster.calls().is_empty());
    assert_eq!(events.events_of_type("ScenarioCompleted").len(), 1);
}

// =============================================================================
// Checksum Continuity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_continuity_passes_when_rebuild_keeps_new_writes() {
    let cluster = cluster_with_pools();
    cluster.add_pod("default", "fio-app");
    let id = cluster.add_volume("vol-1", 3, Some("node-1"));
    let (ctx, _) = context(&cluster);

    let report = run_scenario(&ChecksumContinuityScenario::new(id.clone(), "fio-app"), &ctx).await;

    assert!(report.passed, "{}", report.summary());
    assert_eq!(report.steps.len(), 7);
    assert_eq!(report.steps[0], "pod fio-app running");
    assert_eq!(report.steps[6], "md5 verify passed after rebuild");
    assert_eq!(cluster.calls_starting_with("exec default/fio-app fio").len(), 4);
    assert_eq!(cluster.volume(&id).unwrap().replicas.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_continuity_reports_stale_blocks_as_integrity_violation() {
    let cluster = cluster_with_pools();
    cluster.add_pod("default", "fio-app");
    let id = cluster.add_volume("vol-1", 3, Some("node-1"));
    for _ in 0..3 {
        cluster.push_fio_output(fio_ok());
    }
    cluster.push_fio_output(ExecOutput {
        success: false,
        exit_code: Some(1),
        output: "verify: bad magic header 0, wanted acca at file /dev/sdm offset 8192, length 4096 (md5)"
            .to_string(),
    });
    let (ctx, events) = context(&cluster);

    let report = run_scenario(&ChecksumContinuityScenario::new(id, "fio-app"), &ctx).await;

    assert_matches!(
        &report.error,
        Some(Error::DataIntegrity { target, algorithm, .. })
            if target == "fio-app" && algorithm == "md5"
    );
    assert_eq!(report.steps.len(), 6);
    assert_eq!(events.events_of_type("IntegrityViolation").len(), 1);
}

// =============================================================================
// Pools
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_pool_recreate_drains_and_rebuilds_pool() {
    let cluster = cluster_with_pools();
    cluster.add_volume("vol-1", 3, Some("node-1"));
    cluster.add_volume("vol-2", 1, Some("node-3"));
    let (ctx, _) = context(&cluster);

    let report = run_scenario(&PoolRecreateScenario::new("pool-on-node-2"), &ctx).await;

    assert!(report.passed, "{}", report.summary());
    assert_eq!(report.steps[0], "deleted 1 volume(s) using pool-on-node-2");
    assert_eq!(cluster.calls_starting_with("delete_volume"), vec!["delete_volume vol-1"]);
    assert_eq!(cluster.calls_starting_with("delete_pool"), vec!["delete_pool pool-on-node-2"]);
    assert_eq!(
        cluster.calls_starting_with("create_pool"),
        vec!["create_pool pool-on-node-2 node-2 /dev/sdb"]
    );
    let pool = cluster.pool("pool-on-node-2").unwrap();
    assert_eq!(pool.state, PoolState::Online);
    assert_eq!(pool.used, 0);
    assert!(cluster.volume(&VolumeId::new("vol-2")).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stale_pool_is_removed_after_power_on() {
    let cluster = cluster_with_pools();
    let (ctx, _) = context(&cluster);

    let report = run_scenario(&StalePoolScenario::new("pool-on-node-2"), &ctx).await;

    assert!(report.passed, "{}", report.summary());
    assert_eq!(report.steps.last().map(String::as_str), Some("all pools online"));
    assert!(!cluster.is_powered_off("node-2"));
    assert!(cluster.pool("pool-on-node-2").is_none());

    let replacement: Vec<String> = cluster
        .pool_names()
        .into_iter()
        .filter(|name| name.starts_with("pool-on-node-2-"))
        .collect();
    assert_eq!(replacement.len(), 1);
    assert_eq!(replacement[0].len(), "pool-on-node-2-".len() + 8);
    let pool = cluster.pool(&replacement[0]).unwrap();
    assert_eq!(pool.node, "node-2");
    assert_eq!(pool.disks, vec!["/dev/sdb".to_string()]);
    assert_eq!(pool.state, PoolState::Online);
}

#[tokio::test(start_paused = true)]
async fn test_restore_after_stale_pool_brings_back_layout() {
    let cluster = cluster_with_pools();
    let (ctx, _) = context(&cluster);
    let stale = run_scenario(&StalePoolScenario::new("pool-on-node-3"), &ctx).await;
    assert!(stale.passed, "{}", stale.summary());

    let first = ctx.pools.restore_configured_pools().await.unwrap();
    assert_eq!(first.created, vec!["pool-on-node-3".to_string()]);
    assert_eq!(first.deleted.len(), 1);
    assert!(first.deleted[0].starts_with("pool-on-node-3-"));
    assert_eq!(
        cluster.pool_names(),
        vec!["pool-on-node-1", "pool-on-node-2", "pool-on-node-3"]
    );

    let calls = cluster.calls().len();
    let second = ctx.pools.restore_configured_pools().await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.unchanged.len(), 3);
    assert_eq!(cluster.calls().len(), calls);
}
