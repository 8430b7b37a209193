//! Data integrity verification
//!
//! Two independent checks are offered:
//!
//! - fio workloads run inside the application pod. A write phase tags every
//!   block with a checksum, and a later verify phase re-reads them. A stale
//!   block still carrying another algorithm's tag fails verification.
//! - Raw replica checksums taken from a node through the e2e agent. Each
//!   replica is connected over NVMe-oF, summed with `cksum` and disconnected
//!   again, so that diverged replicas can be detected directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};

use super::fio::{is_verify_failure, verify_failure_line, ChecksumAlgorithm, FioJob, ThinkTime};
use crate::config::IntegrityConfig;
use crate::domain::{DomainEvent, EventPublisher, ExecOutput, NodeAgent, PodExec, Replica};
use crate::error::{Error, Result};
use crate::metrics::SentinelMetrics;

/// NVMe-oF TCP service port of the storage engine.
const NVMF_PORT: u16 = 8420;

/// Model string the storage engine reports for its NVMe controllers.
const NVME_MODEL: &str = "Mayastor NVMe controller";

/// A replica reachable over NVMe-oF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTarget {
    pub target_ip: String,
    pub uri: String,
}

impl ReplicaTarget {
    pub fn new(target_ip: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            target_ip: target_ip.into(),
            uri: uri.into(),
        }
    }

    /// Target for an `nvmf://host:port/nqn` replica. Local `bdev:///`
    /// replicas are not reachable and yield `None`.
    pub fn from_replica(replica: &Replica) -> Option<Self> {
        let rest = replica.uri.strip_prefix("nvmf://")?;
        let authority = rest.split('/').next()?;
        let host = authority.split(':').next()?;
        (!host.is_empty()).then(|| Self::new(host, replica.uri.clone()))
    }
}

/// Substring of `uri` from `nqn.` up to the query string.
pub fn nqn_from_uri(uri: &str) -> Option<&str> {
    let start = uri.find("nqn.")?;
    let rest = &uri[start..];
    Some(rest.split('?').next().unwrap_or(rest))
}

/// Device of the last engine controller listed by `nvme list`.
fn engine_device(nvme_list: &str) -> Option<String> {
    nvme_list
        .lines()
        .filter(|l| l.contains(NVME_MODEL))
        .filter_map(|l| l.split_whitespace().find(|t| t.starts_with("/dev/nvme")))
        .last()
        .map(str::to_string)
}

/// Runs fio workloads in application pods and checksums replicas.
#[derive(Clone)]
pub struct DataIntegrityVerifier {
    exec: Arc<dyn PodExec>,
    agent: Arc<dyn NodeAgent>,
    events: Arc<dyn EventPublisher>,
    metrics: Option<SentinelMetrics>,
    namespace: String,
    device: String,
    fio_timeout: Duration,
}

impl std::fmt::Debug for DataIntegrityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataIntegrityVerifier")
            .field("namespace", &self.namespace)
            .field("device", &self.device)
            .field("fio_timeout", &self.fio_timeout)
            .finish()
    }
}

impl DataIntegrityVerifier {
    pub fn new(
        exec: Arc<dyn PodExec>,
        agent: Arc<dyn NodeAgent>,
        events: Arc<dyn EventPublisher>,
        config: &IntegrityConfig,
    ) -> Self {
        Self {
            exec,
            agent,
            events,
            metrics: None,
            namespace: config.app_namespace.clone(),
            device: config.device.clone(),
            fio_timeout: config.fio_timeout(),
        }
    }

    pub fn with_metrics(mut self, metrics: SentinelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_fio_timeout(mut self, fio_timeout: Duration) -> Self {
        self.fio_timeout = fio_timeout;
        self
    }

    pub fn fio_timeout(&self) -> Duration {
        self.fio_timeout
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "failed to publish integrity event");
        }
    }

    async fn violation(&self, target: &str, algorithm: &str, detail: String) -> Error {
        warn!(subject = target, algorithm, %detail, "data integrity violation");
        if let Some(metrics) = &self.metrics {
            metrics.record_integrity_violation();
        }
        self.publish(DomainEvent::integrity_violation(target, algorithm, detail.clone()))
            .await;
        Error::DataIntegrity {
            target: target.to_string(),
            algorithm: algorithm.to_string(),
            detail,
        }
    }

    async fn run_fio(&self, pod: &str, job: &FioJob) -> Result<ExecOutput> {
        let args = job.args();
        let what = format!("fio {} on {} to finish", job.phase().as_str(), pod);
        debug!(pod, command = %args.join(" "), "running fio");
        let started = Instant::now();
        let output = timeout(self.fio_timeout, self.exec.exec(&self.namespace, pod, &args))
            .await
            .map_err(|_| Error::Timeout {
                what,
                waited: self.fio_timeout,
                last_observed: "fio still running".to_string(),
            })??;
        if output.success {
            self.publish(DomainEvent::workload_completed(
                pod,
                job.phase().as_str(),
                job.algorithm().as_str(),
                started.elapsed(),
            ))
            .await;
        }
        Ok(output)
    }

    // =========================================================================
    // fio Workloads
    // =========================================================================

    /// Fill the device with blocks tagged by `algorithm`.
    ///
    /// A failed write phase is [`Error::Exec`].
    #[instrument(skip(self))]
    pub async fn run_write_workload(
        &self,
        pod: &str,
        algorithm: ChecksumAlgorithm,
        think_time: Option<ThinkTime>,
    ) -> Result<()> {
        let job = FioJob::write(&self.device, algorithm).with_think_time(think_time);
        let output = self.run_fio(pod, &job).await?;
        if !output.success {
            return Err(Error::Exec {
                command: job.args().join(" "),
                output: output.output,
            });
        }
        info!(pod, %algorithm, "write workload completed");
        Ok(())
    }

    /// Re-read the device and check every block against `algorithm`.
    ///
    /// Any failure of the verify phase is [`Error::DataIntegrity`].
    #[instrument(skip(self))]
    pub async fn run_verify_workload(&self, pod: &str, algorithm: ChecksumAlgorithm) -> Result<()> {
        let job = FioJob::verify(&self.device, algorithm);
        let output = self.run_fio(pod, &job).await?;
        if !output.success || is_verify_failure(&output.output) {
            let detail = verify_failure_line(&output.output)
                .map(str::to_string)
                .unwrap_or_else(|| match output.exit_code {
                    Some(code) => format!("fio exited with {}: {}", code, output.output.trim()),
                    None => format!("fio terminated: {}", output.output.trim()),
                });
            return Err(self.violation(pod, algorithm.as_str(), detail).await);
        }
        info!(pod, %algorithm, "verify workload passed");
        Ok(())
    }

    // =========================================================================
    // Replica Checksums
    // =========================================================================

    /// `cksum` of the data partition of a replica, read over NVMe-oF from
    /// the host at `initiator_ip`.
    #[instrument(skip(self))]
    pub async fn checksum_replica(
        &self,
        initiator_ip: &str,
        target_ip: &str,
        uri: &str,
    ) -> Result<String> {
        let nqn = nqn_from_uri(uri)
            .ok_or_else(|| Error::ResponseParse(format!("replica uri {} carries no NQN", uri)))?;

        let connect = format!("nvme connect -a {} -t tcp -s {} -n {}", target_ip, NVMF_PORT, nqn);
        self.agent.exec(initiator_ip, &connect).await?;

        let summed = self.checksum_connected(initiator_ip).await;

        let disconnect = format!("nvme disconnect -n{}", nqn);
        let disconnected = self.agent.exec(initiator_ip, &disconnect).await;

        let (checksum, device) = summed?;
        disconnected?;

        let listing = self.agent.exec(initiator_ip, "ls /dev/").await?;
        let name = device.trim_start_matches("/dev/");
        if listing.split_whitespace().any(|entry| entry == name) {
            return Err(Error::Exec {
                command: disconnect,
                output: format!("{} still present after disconnect", device),
            });
        }
        debug!(uri, %checksum, "replica checksum");
        Ok(checksum)
    }

    /// Returns the checksum and the connected controller device.
    async fn checksum_connected(&self, initiator_ip: &str) -> Result<(String, String)> {
        let listing = self.agent.exec(initiator_ip, "nvme list").await?;
        let device = engine_device(&listing).ok_or_else(|| Error::Exec {
            command: "nvme list".to_string(),
            output: listing.clone(),
        })?;
        let partition = format!("{}p2", device);
        let command = format!("cksum {}", partition);
        let output = self.agent.exec(initiator_ip, &command).await?;
        if !output.contains(&partition) {
            return Err(Error::Exec { command, output });
        }
        let checksum = output
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| Error::Exec {
                command: command.clone(),
                output: output.clone(),
            })?;
        Ok((checksum, device))
    }

    /// Checksum every target and require them to agree.
    ///
    /// Returns the common checksum.
    pub async fn verify_replicas_identical(
        &self,
        initiator_ip: &str,
        targets: &[ReplicaTarget],
    ) -> Result<String> {
        let mut sums = Vec::with_capacity(targets.len());
        for target in targets {
            let sum = self
                .checksum_replica(initiator_ip, &target.target_ip, &target.uri)
                .await?;
            sums.push((target.uri.as_str(), sum));
        }
        let Some((_, first)) = sums.first() else {
            return Err(Error::Internal("no replicas to compare".to_string()));
        };
        if sums.iter().all(|(_, s)| s == first) {
            return Ok(first.clone());
        }
        let detail = sums
            .iter()
            .map(|(uri, sum)| format!("{}={}", uri, sum))
            .collect::<Vec<_>>()
            .join(", ");
        let target = targets
            .iter()
            .map(|t| t.uri.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Err(self
            .violation(&target, "cksum", format!("replica checksums differ: {}", detail))
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryEventCollector};
    use assert_matches::assert_matches;

    fn verifier(cluster: &Arc<InMemoryCluster>) -> (DataIntegrityVerifier, Arc<InMemoryEventCollector>) {
        let events = Arc::new(InMemoryEventCollector::new());
        let v = DataIntegrityVerifier::new(
            cluster.clone(),
            cluster.clone(),
            events.clone(),
            &IntegrityConfig::default(),
        );
        (v, events)
    }

    #[test]
    fn test_nqn_from_uri() {
        assert_eq!(
            nqn_from_uri("nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:abc?uuid=abc"),
            Some("nqn.2019-05.io.openebs:abc")
        );
        assert_eq!(
            nqn_from_uri("nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:abc"),
            Some("nqn.2019-05.io.openebs:abc")
        );
        assert_eq!(nqn_from_uri("bdev:///abc?uuid=abc"), None);
    }

    #[test]
    fn test_engine_device_takes_last_controller() {
        let listing = "/dev/nvme0n1  S4  Samsung\n/dev/nvme1n1  aa  Mayastor NVMe controller\n/dev/nvme2n1  bb  Mayastor NVMe controller\n";
        assert_eq!(engine_device(listing).as_deref(), Some("/dev/nvme2n1"));
        assert_eq!(engine_device("/dev/nvme0n1  S4  Samsung"), None);
    }

    #[test]
    fn test_replica_target_from_uri() {
        let replica = Replica {
            uuid: "r1".into(),
            node: "node-2".into(),
            pool: "pool-on-node-2".into(),
            uri: "nvmf://10.0.0.2:8420/nqn.2019-05.io.openebs:r1?uuid=r1".into(),
            offline: false,
        };
        assert_eq!(
            ReplicaTarget::from_replica(&replica),
            Some(ReplicaTarget::new("10.0.0.2", replica.uri.clone()))
        );
        let local = Replica {
            uri: "bdev:///r1?uuid=r1".into(),
            ..replica
        };
        assert_eq!(ReplicaTarget::from_replica(&local), None);
    }

    // =========================================================================
    // fio Workload Tests
    // =========================================================================

    #[tokio::test]
    async fn test_write_then_verify_same_algorithm() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        cluster.add_pod("default", "fio-app");
        let (v, events) = verifier(&cluster);

        v.run_write_workload("fio-app", ChecksumAlgorithm::Crc32, None)
            .await
            .unwrap();
        v.run_verify_workload("fio-app", ChecksumAlgorithm::Crc32)
            .await
            .unwrap();
        assert_eq!(events.events_of_type("WorkloadCompleted").len(), 2);
    }

    #[tokio::test]
    async fn test_verify_with_stale_tag_is_integrity_violation() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        cluster.add_pod("default", "fio-app");
        let (v, events) = verifier(&cluster);
        let metrics = SentinelMetrics::new(prometheus::Registry::new()).unwrap();
        let v = v.with_metrics(metrics.clone());

        v.run_write_workload("fio-app", ChecksumAlgorithm::Crc32, None)
            .await
            .unwrap();
        let err = v
            .run_verify_workload("fio-app", ChecksumAlgorithm::Md5)
            .await
            .unwrap_err();

        assert_matches!(err, Error::DataIntegrity { ref algorithm, ref detail, .. }
            if algorithm == "md5" && detail.contains("bad magic header"));
        assert_eq!(events.events_of_type("IntegrityViolation").len(), 1);
        assert!(metrics.encode().unwrap().contains("replica_sentinel_integrity_violations_total 1"));
    }

    #[tokio::test]
    async fn test_failed_write_is_exec_error() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        cluster.add_pod("default", "fio-app");
        cluster.push_fio_output(ExecOutput {
            success: false,
            exit_code: Some(1),
            output: "fio: io_u error on file /dev/sdm: Input/output error".into(),
        });
        let (v, _) = verifier(&cluster);

        let err = v
            .run_write_workload("fio-app", ChecksumAlgorithm::Md5, Some(ThinkTime::new(10, 1)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Exec { ref output, .. } if output.contains("Input/output"));
    }

    #[tokio::test]
    async fn test_missing_pod_propagates_not_found() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        let (v, _) = verifier(&cluster);
        let err = v
            .run_verify_workload("nope", ChecksumAlgorithm::Md5)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fio_timeout() {
        let cluster = InMemoryCluster::with_nodes(&["node-1"]);
        cluster.add_pod("default", "fio-app");
        cluster.set_exec_delay(Duration::from_secs(600));
        let (v, _) = verifier(&cluster);
        let v = v.with_fio_timeout(IntegrityConfig::fio_timeout_for_volume(1024));
        assert_eq!(v.fio_timeout(), Duration::from_secs(512));

        let err = v
            .run_write_workload("fio-app", ChecksumAlgorithm::Crc32, None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "timed out after 512s waiting for fio write on fio-app to finish \
             (last observed: fio still running)"
        );
    }

    // =========================================================================
    // Replica Checksum Tests
    // =========================================================================

    #[tokio::test]
    async fn test_checksum_replica_connects_and_disconnects() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        let id = cluster.add_volume("vol-1", 2, Some("node-1"));
        let replica = cluster.volume(&id).unwrap().replicas[1].clone();
        cluster.set_replica_checksum(&replica.uuid, "1234");
        let (v, _) = verifier(&cluster);

        let target = ReplicaTarget::from_replica(&replica).unwrap();
        let sum = v
            .checksum_replica("10.0.0.1", &target.target_ip, &target.uri)
            .await
            .unwrap();
        assert_eq!(sum, "1234");

        let calls = cluster.calls_starting_with("agent exec 10.0.0.1");
        assert!(calls[0].contains("nvme connect -a 10.0.0.2 -t tcp -s 8420 -n nqn."));
        assert!(calls.iter().any(|c| c.contains("nvme disconnect -nnqn.")));
        assert!(calls.last().unwrap().ends_with("ls /dev/"));
    }

    #[tokio::test]
    async fn test_diverged_replicas_detected() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2", "node-3"]);
        let id = cluster.add_volume("vol-1", 3, Some("node-1"));
        let replicas = cluster.volume(&id).unwrap().replicas;
        let targets: Vec<ReplicaTarget> = replicas
            .iter()
            .filter_map(ReplicaTarget::from_replica)
            .collect();
        assert_eq!(targets.len(), 3);
        let (v, events) = verifier(&cluster);

        let sum = v.verify_replicas_identical("10.0.0.1", &targets).await.unwrap();
        assert_eq!(sum, crate::adapters::in_memory::DEFAULT_REPLICA_CHECKSUM);

        cluster.set_replica_checksum(&replicas[2].uuid, "99");
        let err = v
            .verify_replicas_identical("10.0.0.1", &targets)
            .await
            .unwrap_err();
        assert_matches!(err, Error::DataIntegrity { ref algorithm, .. } if algorithm == "cksum");
        assert_eq!(events.events_of_type("IntegrityViolation").len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_initiator_fails() {
        let cluster = InMemoryCluster::with_nodes(&["node-1", "node-2"]);
        crate::domain::Platform::power_off_node(cluster.as_ref(), "node-1")
            .await
            .unwrap();
        let (v, _) = verifier(&cluster);
        let err = v
            .checksum_replica("10.0.0.1", "10.0.0.2", "nvmf://10.0.0.2:8420/nqn.x:r?uuid=r")
            .await
            .unwrap_err();
        assert_matches!(err, Error::Agent { .. });
    }
}
