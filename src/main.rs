//! Replica Sentinel
//!
//! Command-line harness that drives fault scenarios against replicated
//! Mayastor volumes and checks the cluster's response.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Replica Sentinel                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Observer   │───▶│    Fault     │───▶│  Integrity   │       │
//! │  │   (Eyes)     │    │   Injector   │    │   Verifier   │       │
//! │  │              │    │   (Hands)    │    │   (Judge)    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use kube::Client;
use prometheus::Registry;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replica_sentinel::adapters::{
    ControlPlaneClient, E2eAgentClient, HcloudPlatform, KubeCluster, KubectlExec,
    LoggingEventPublisher,
};
use replica_sentinel::config::{PlatformKind, SentinelConfig};
use replica_sentinel::domain::{ClusterObjects, Platform, VolumeId};
use replica_sentinel::integrity::{ReplicaTarget, ThinkTime};
use replica_sentinel::metrics::SentinelMetrics;
use replica_sentinel::scenario::{
    ChecksumContinuityScenario, PoolRecreateScenario, ReplicaRebuildScenario, StalePoolScenario,
};
use replica_sentinel::{run_scenario, ClusterPorts, Scenario, ScenarioContext};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Replica Sentinel - fault injection and consistency checks for replicated volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "SENTINEL_CONFIG")]
    config: Option<String>,

    /// Namespace the storage system is installed in
    #[arg(long, env = "MAYASTOR_NAMESPACE")]
    namespace: Option<String>,

    /// Control plane version (v0 = custom resources, v1 = REST)
    #[arg(long, env = "CONTROL_PLANE")]
    control_plane: Option<String>,

    /// Node addresses serving the REST control plane
    #[arg(long, env = "REST_ENDPOINTS", value_delimiter = ',')]
    rest_endpoints: Vec<String>,

    /// Cloud platform used for power faults (hetzner, none)
    #[arg(long, env = "PLATFORM")]
    platform: Option<String>,

    /// Disk device backing the configured pools
    #[arg(long, env = "POOL_DEVICE")]
    pool_device: Option<String>,

    /// Serve Prometheus metrics on this address while running
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that all pools are online and no volume is unhealthy
    Check {
        /// Also require that no volumes exist and pools are empty
        #[arg(long)]
        expect_empty: bool,
    },

    /// Restore the configured one-pool-per-storage-node layout
    RestorePools,

    /// Scale a volume up, wait for the rebuild, and scale it back down
    Rebuild {
        volume: String,
        /// Replica count to scale up to
        #[arg(long, default_value = "3")]
        replicas: u32,
        /// Replica count to start and end with
        #[arg(long, default_value = "1")]
        base_replicas: u32,
        #[arg(long, default_value = "2")]
        cycles: usize,
        /// Leave the volume at the raised count
        #[arg(long)]
        no_scale_down: bool,
    },

    /// Check data written during a rebuild survives it
    Integrity {
        volume: String,
        /// Application pod with the volume attached
        pod: String,
        /// Seconds before the replica count is restored
        #[arg(long, default_value = "10")]
        delay_secs: u64,
        /// fio think time in microseconds
        #[arg(long)]
        think_time_micros: Option<u64>,
        /// Blocks written between think-time pauses
        #[arg(long, default_value = "1")]
        think_time_blocks: u32,
    },

    /// Compare checksums of every replica of a volume over NVMe-oF
    VerifyReplicas {
        volume: String,
        /// Node that connects to the replicas
        #[arg(long)]
        initiator: String,
    },

    /// Drain, delete and recreate a pool
    PoolRecreate { pool: String },

    /// Delete a pool while its node is powered off and recreate it
    StalePool { pool: String },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = load_config(&args)?;
    info!("Starting Replica Sentinel");
    info!("  Namespace: {}", config.namespace);
    info!("  Control plane: {}", config.control_plane);
    info!("  Platform: {:?}", config.platform);

    let client = Client::try_default()
        .await
        .context("Kubernetes client creation failed")?;
    info!("Connected to Kubernetes cluster");

    let metrics = SentinelMetrics::new(Registry::new())?;
    if let Some(addr) = args.metrics_addr.clone() {
        let server_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, server_metrics).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let ports = build_ports(client, &config)?;
    let cluster = ports.cluster.clone();
    let ctx = ScenarioContext::new(
        ports,
        config,
        Arc::new(LoggingEventPublisher::info_level()),
        Some(metrics),
    );

    match args.command {
        Command::Check { expect_empty } => check(&ctx, expect_empty).await,
        Command::RestorePools => {
            let report = ctx.pools.restore_configured_pools().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Rebuild {
            volume,
            replicas,
            base_replicas,
            cycles,
            no_scale_down,
        } => {
            let mut scenario = ReplicaRebuildScenario::new(VolumeId::new(volume), replicas)
                .with_base_replicas(base_replicas)
                .with_cycles(cycles);
            if no_scale_down {
                scenario = scenario.without_scale_down();
            }
            run(&scenario, &ctx).await
        }
        Command::Integrity {
            volume,
            pod,
            delay_secs,
            think_time_micros,
            think_time_blocks,
        } => {
            let mut scenario = ChecksumContinuityScenario::new(VolumeId::new(volume), pod)
                .with_delay(Duration::from_secs(delay_secs));
            if let Some(micros) = think_time_micros {
                scenario = scenario.with_think_time(ThinkTime::new(micros, think_time_blocks));
            }
            run(&scenario, &ctx).await
        }
        Command::VerifyReplicas { volume, initiator } => {
            verify_replicas(&ctx, cluster.as_ref(), &VolumeId::new(volume), &initiator).await
        }
        Command::PoolRecreate { pool } => run(&PoolRecreateScenario::new(pool), &ctx).await,
        Command::StalePool { pool } => run(&StalePoolScenario::new(pool), &ctx).await,
    }
}

// =============================================================================
// Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

/// File configuration with command-line overrides applied.
fn load_config(args: &Args) -> anyhow::Result<SentinelConfig> {
    let mut config = match &args.config {
        Some(path) => SentinelConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => SentinelConfig::default(),
    };

    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(version) = &args.control_plane {
        config.control_plane = version.parse()?;
    }
    if !args.rest_endpoints.is_empty() {
        config.rest_endpoints = args.rest_endpoints.clone();
    }
    if let Some(platform) = &args.platform {
        config.platform = platform.parse()?;
    }
    if let Some(device) = &args.pool_device {
        config.pools.device = device.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_ports(client: Client, config: &SentinelConfig) -> anyhow::Result<ClusterPorts> {
    let control_plane = Arc::new(ControlPlaneClient::from_config(client.clone(), config)?);
    let platform: Option<Arc<dyn Platform>> = match config.platform {
        PlatformKind::Hetzner => Some(Arc::new(HcloudPlatform::default())),
        PlatformKind::None => None,
    };

    Ok(ClusterPorts {
        control_plane: control_plane.clone(),
        nexus: control_plane,
        cluster: Arc::new(KubeCluster::new(client, config.namespace.clone())),
        exec: Arc::new(KubectlExec::default()),
        agent: Arc::new(E2eAgentClient::new(&config.faults)?),
        platform,
    })
}

// =============================================================================
// Commands
// =============================================================================

async fn run(scenario: &dyn Scenario, ctx: &ScenarioContext) -> anyhow::Result<()> {
    let report = run_scenario(scenario, ctx).await;
    println!("{}", report.summary());
    for step in &report.steps {
        println!("  - {}", step);
    }
    let name = report.name.clone();
    report
        .into_result()
        .with_context(|| format!("scenario {} failed", name))?;
    Ok(())
}

async fn check(ctx: &ScenarioContext, expect_empty: bool) -> anyhow::Result<()> {
    let control_plane = ctx.snapshot.control_plane();
    let (nodes, pools, volumes, unhealthy) = futures::try_join!(
        control_plane.list_storage_nodes(),
        ctx.snapshot.pools(),
        control_plane.list_volumes(),
        ctx.snapshot.unhealthy_volumes(),
    )?;

    println!("storage nodes: {}", nodes.len());
    for node in &nodes {
        println!("  {} {}", node.name, node.state);
    }
    println!("pools: {}", pools.len());
    for pool in &pools {
        println!(
            "  {} on {} {} used={} capacity={}",
            pool.name, pool.node, pool.state, pool.used, pool.capacity
        );
    }
    println!("volumes: {} ({} unhealthy)", volumes.len(), unhealthy.len());

    let offline: Vec<_> = pools
        .iter()
        .filter(|p| !p.is_online())
        .map(|p| p.name.as_str())
        .collect();
    if !offline.is_empty() {
        bail!("pools not online: {}", offline.join(", "));
    }
    if !unhealthy.is_empty() {
        let ids: Vec<_> = unhealthy.iter().map(|v| v.id.to_string()).collect();
        bail!("unhealthy volumes: {}", ids.join(", "));
    }
    if expect_empty {
        if !volumes.is_empty() {
            bail!("{} volume(s) still exist", volumes.len());
        }
        let used = ctx.pools.cluster_usage().await?;
        if used != 0 {
            bail!("pools still hold {} bytes", used);
        }
    }
    Ok(())
}

async fn verify_replicas(
    ctx: &ScenarioContext,
    cluster: &dyn ClusterObjects,
    volume_id: &VolumeId,
    initiator: &str,
) -> anyhow::Result<()> {
    let initiator_ip = cluster
        .node_locations()
        .await?
        .into_iter()
        .find(|n| n.name == initiator)
        .map(|n| n.ip_address)
        .with_context(|| format!("node {} not found", initiator))?;

    let replicas = ctx.snapshot.replicas(volume_id).await?;
    let targets: Vec<ReplicaTarget> = replicas.iter().filter_map(ReplicaTarget::from_replica).collect();
    if targets.len() < replicas.len() {
        warn!(
            volume = %volume_id,
            skipped = replicas.len() - targets.len(),
            "Replicas without an NVMe-oF share are not compared"
        );
    }

    let checksum = ctx
        .verifier
        .verify_replicas_identical(&initiator_ip, &targets)
        .await?;
    println!("{} replicas of {} match: {}", targets.len(), volume_id, checksum);
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: SentinelMetrics) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr.parse().context("Invalid metrics server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Metrics server accept error")?;

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let metrics = metrics.clone();
            async move {
                let response = match req.uri().path() {
                    "/metrics" => match metrics.encode() {
                        Ok(body) => respond(StatusCode::OK, body),
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    },
                    _ => respond(StatusCode::NOT_FOUND, "not found"),
                };
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
