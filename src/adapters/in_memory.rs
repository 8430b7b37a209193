//! In-memory cluster
//!
//! A scriptable stand-in for a whole storage cluster. [`InMemoryCluster`]
//! implements every port, reacts to faults the way the storage system does
//! (a replica scale-up or a faulted child starts a rebuild that completes
//! after a number of reads) and records every mutating call.
//!
//! Rebuilds advance on *reads* of the volume rather than on wall time so that
//! tests are deterministic under a paused tokio clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::ports::{ENGINE_LABEL_KEY, ENGINE_LABEL_VALUE};
use crate::domain::{
    Child, ChildState, ClusterObjects, ControlPlane, ControlPlaneVersion, ExecOutput, Nexus,
    NexusControl, NexusState, NodeAgent, NodeLocation, NodeState, Platform, PodExec, Pool,
    PoolState, PowerState, Replica, StorageNode, Volume, VolumeId, VolumeState,
};
use crate::error::{Error, Result};
use crate::scenario::ClusterPorts;

/// Size given to volumes created through [`InMemoryCluster::add_volume`].
pub const VOLUME_SIZE: u64 = 1 << 30;

/// Capacity given to pools.
pub const POOL_CAPACITY: u64 = 10 << 30;

/// Checksum every replica reports until told otherwise.
pub const DEFAULT_REPLICA_CHECKSUM: &str = "3735928559";

const DEFAULT_REBUILD_READS: usize = 6;
const NQN_PREFIX: &str = "nqn.2019-05.io.openebs:";

/// Mutation applied to a volume on a scripted read.
pub type VolumeHook = Box<dyn FnOnce(&mut Volume) + Send>;

struct ReadHook {
    remaining: usize,
    apply: VolumeHook,
}

struct VolumeEntry {
    volume: Volume,
    hooks: Vec<ReadHook>,
    /// Reads left before an in-flight rebuild completes
    rebuild: Option<usize>,
}

impl VolumeEntry {
    fn on_read(&mut self) {
        for hook in &mut self.hooks {
            hook.remaining = hook.remaining.saturating_sub(1);
        }
        let (ready, pending): (Vec<_>, Vec<_>) =
            self.hooks.drain(..).partition(|h| h.remaining == 0);
        self.hooks = pending;
        for hook in ready {
            (hook.apply)(&mut self.volume);
        }

        self.rebuild = match self.rebuild {
            Some(0) => {
                self.complete_rebuild();
                None
            }
            Some(n) => Some(n - 1),
            None => None,
        };
    }

    fn complete_rebuild(&mut self) {
        let volume = &mut self.volume;
        if let Some(nexus) = volume.nexus.as_mut() {
            for child in &mut nexus.children {
                child.state = ChildState::Online;
            }
            nexus.state = NexusState::Online;
        }
        if volume.replicas.iter().all(|r| !r.offline) {
            volume.state = VolumeState::Healthy;
        }
    }

    fn start_rebuild(&mut self, reads: usize) {
        if let Some(nexus) = self.volume.nexus.as_mut() {
            nexus.state = NexusState::Degraded;
        }
        self.volume.state = VolumeState::Degraded;
        self.rebuild = Some(reads);
    }
}

struct PoolEntry {
    pool: Pool,
    settle_reads: usize,
    pending_delete: bool,
}

#[derive(Default)]
struct ClusterState {
    volumes: BTreeMap<VolumeId, VolumeEntry>,
    pools: BTreeMap<String, PoolEntry>,
    nodes: Vec<NodeLocation>,
    labels: HashMap<String, BTreeMap<String, String>>,
    storage_nodes: BTreeMap<String, NodeState>,
    powered_off: HashSet<String>,
    pods: HashSet<(String, String)>,
    read_failures: VecDeque<u16>,
    rebuild_reads: usize,
    pool_settle_reads: usize,
    fio_outputs: VecDeque<ExecOutput>,
    /// Checksum algorithm last written per pod
    written: HashMap<String, String>,
    /// Connected NVMe-oF targets: nqn to device
    connected: BTreeMap<String, String>,
    replica_checksums: HashMap<String, String>,
    dropped_connections: HashMap<String, BTreeSet<String>>,
    exec_delay: Option<Duration>,
}

impl ClusterState {
    fn check_read(&mut self, what: &str) -> Result<()> {
        match self.read_failures.pop_front() {
            Some(status) => Err(Error::ControlPlane {
                status,
                message: format!("injected failure reading {}", what),
            }),
            None => Ok(()),
        }
    }

    fn node_ip(&self, node: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| n.name == node)
            .map(|n| n.ip_address.clone())
    }

    fn node_by_ip(&self, ip: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|n| n.ip_address == ip)
            .map(|n| n.name.clone())
    }

    fn engine_running(&self, node: &str) -> bool {
        !self.powered_off.contains(node)
            && self
                .labels
                .get(node)
                .and_then(|l| l.get(ENGINE_LABEL_KEY))
                .is_some_and(|v| v == ENGINE_LABEL_VALUE)
    }

    fn pool_on_node(&self, node: &str) -> Option<&Pool> {
        self.pools
            .values()
            .map(|p| &p.pool)
            .find(|p| p.node == node && !p.name.is_empty())
    }

    /// A node that can take a new replica of `volume`, preferring nodes with an online pool.
    fn free_node(&self, volume: &Volume, exclude: &[String]) -> Option<String> {
        let used = volume.replica_nodes();
        let candidates: Vec<&NodeLocation> = self
            .nodes
            .iter()
            .filter(|n| self.engine_running(&n.name))
            .filter(|n| !used.contains(&n.name) && !exclude.contains(&n.name))
            .collect();

        candidates
            .iter()
            .find(|n| self.pool_on_node(&n.name).is_some_and(|p| p.is_online()))
            .or_else(|| candidates.first())
            .map(|n| n.name.clone())
    }

    fn new_replica(&mut self, node: &str, size: u64) -> Replica {
        let uuid = Uuid::new_v4().to_string();
        let ip = self.node_ip(node).unwrap_or_default();
        let pool = match self.pool_on_node(node) {
            Some(p) => p.name.clone(),
            None => format!("pool-on-{}", node),
        };
        if let Some(entry) = self.pools.get_mut(&pool) {
            entry.pool.used += size;
        }
        Replica {
            uri: format!("nvmf://{}:8420/{}{}?uuid={}", ip, NQN_PREFIX, uuid, uuid),
            uuid,
            node: node.to_string(),
            pool,
            offline: false,
        }
    }

    fn release_replica(&mut self, replica: &Replica, size: u64) {
        if let Some(entry) = self.pools.get_mut(&replica.pool) {
            entry.pool.used = entry.pool.used.saturating_sub(size);
        }
    }

    fn apply_power_off(&mut self, node: &str) {
        self.powered_off.insert(node.to_string());
        self.storage_nodes
            .insert(node.to_string(), NodeState::Offline);
        for entry in self.pools.values_mut() {
            if entry.pool.node == node {
                entry.pool.state = PoolState::Offline;
            }
        }
        for entry in self.volumes.values_mut() {
            let volume = &mut entry.volume;
            let mut affected = false;
            for replica in volume.replicas.iter_mut().filter(|r| r.node == node) {
                replica.offline = true;
                affected = true;
            }
            if let Some(nexus) = volume.nexus.as_mut() {
                for child in nexus
                    .children
                    .iter_mut()
                    .filter(|c| c.node.as_deref() == Some(node))
                {
                    child.state = ChildState::Faulted;
                    affected = true;
                }
                if affected {
                    nexus.state = NexusState::Degraded;
                }
            }
            if affected {
                volume.state = VolumeState::Degraded;
                entry.rebuild = None;
            }
        }
    }

    fn apply_power_on(&mut self, node: &str) {
        self.powered_off.remove(node);
        if self.engine_running(node) {
            self.storage_nodes.insert(node.to_string(), NodeState::Online);
        }
        self.pools
            .retain(|_, entry| !(entry.pool.node == node && entry.pending_delete));
        for entry in self.pools.values_mut() {
            if entry.pool.node == node {
                entry.pool.state = PoolState::Online;
            }
        }
        let rebuild_reads = self.rebuild_reads;
        for entry in self.volumes.values_mut() {
            let mut affected = false;
            for replica in entry.volume.replicas.iter_mut().filter(|r| r.node == node) {
                replica.offline = false;
                affected = true;
            }
            if let Some(nexus) = entry.volume.nexus.as_mut() {
                for child in nexus
                    .children
                    .iter_mut()
                    .filter(|c| c.node.as_deref() == Some(node))
                {
                    child.state = ChildState::Degraded;
                }
            }
            if affected {
                entry.start_rebuild(rebuild_reads);
            }
        }
    }

    fn settle_pool(entry: &mut PoolEntry, powered_off: &HashSet<String>) {
        if entry.settle_reads > 0 {
            entry.settle_reads -= 1;
            if entry.settle_reads == 0
                && entry.pool.state == PoolState::Pending
                && !powered_off.contains(&entry.pool.node)
            {
                entry.pool.state = PoolState::Online;
            }
        }
    }
}

/// Scriptable fake of a storage cluster implementing every port.
pub struct InMemoryCluster {
    version: ControlPlaneVersion,
    state: Mutex<ClusterState>,
    calls: Mutex<Vec<String>>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryCluster")
            .field("version", &self.version)
            .field("nodes", &state.nodes.len())
            .field("volumes", &state.volumes.len())
            .field("pools", &state.pools.len())
            .finish()
    }
}

impl InMemoryCluster {
    /// Cluster of storage-engine nodes served by the REST control plane.
    pub fn with_nodes(nodes: &[&str]) -> Arc<Self> {
        Self::with_version(ControlPlaneVersion::V1, nodes)
    }

    pub fn with_version(version: ControlPlaneVersion, nodes: &[&str]) -> Arc<Self> {
        let mut state = ClusterState {
            rebuild_reads: DEFAULT_REBUILD_READS,
            pool_settle_reads: 1,
            ..Default::default()
        };
        for (i, name) in nodes.iter().enumerate() {
            state.nodes.push(NodeLocation {
                name: name.to_string(),
                ip_address: format!("10.0.0.{}", i + 1),
                storage_node: true,
                master_node: false,
            });
            let mut labels = BTreeMap::new();
            labels.insert(ENGINE_LABEL_KEY.to_string(), ENGINE_LABEL_VALUE.to_string());
            state.labels.insert(name.to_string(), labels);
            state.storage_nodes.insert(name.to_string(), NodeState::Online);
        }
        Arc::new(Self {
            version,
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// This cluster behind every port, platform included.
    pub fn ports(self: &Arc<Self>) -> ClusterPorts {
        ClusterPorts {
            control_plane: self.clone(),
            nexus: self.clone(),
            cluster: self.clone(),
            exec: self.clone(),
            agent: self.clone(),
            platform: Some(self.clone()),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Add a control-plane node that does not run the storage engine.
    pub fn add_master(&self, name: &str) {
        let mut state = self.state.lock();
        let ip = format!("10.0.1.{}", state.nodes.len() + 1);
        state.nodes.push(NodeLocation {
            name: name.to_string(),
            ip_address: ip,
            storage_node: false,
            master_node: true,
        });
        state.labels.insert(name.to_string(), BTreeMap::new());
    }

    /// Add a volume with `replicas` replicas, published on `nexus_node` if given.
    ///
    /// Replicas are placed on the nexus node first, then on the other nodes
    /// in declaration order.
    pub fn add_volume(&self, id: &str, replicas: u32, nexus_node: Option<&str>) -> VolumeId {
        let mut state = self.state.lock();
        let volume_id = VolumeId::new(id);

        let mut order: Vec<String> = nexus_node.map(|n| vec![n.to_string()]).unwrap_or_default();
        for node in &state.nodes {
            if node.storage_node && !order.contains(&node.name) {
                order.push(node.name.clone());
            }
        }
        let placed: Vec<Replica> = order
            .iter()
            .take(replicas as usize)
            .map(|node| state.new_replica(node, VOLUME_SIZE))
            .collect();

        let nexus = nexus_node.map(|node| Nexus {
            uuid: id.to_string(),
            node: node.to_string(),
            state: NexusState::Online,
            device_uri: format!(
                "nvmf://{}:8420/{}{}",
                state.node_ip(node).unwrap_or_default(),
                NQN_PREFIX,
                id
            ),
            children: placed
                .iter()
                .map(|r| child_for(r, node, ChildState::Online))
                .collect(),
        });

        let volume = Volume {
            id: volume_id.clone(),
            desired_replicas: replicas,
            state: VolumeState::Healthy,
            size_bytes: VOLUME_SIZE,
            nexus,
            replicas: placed,
            target_node: nexus_node.map(str::to_string),
        };
        state.volumes.insert(
            volume_id.clone(),
            VolumeEntry {
                volume,
                hooks: Vec::new(),
                rebuild: None,
            },
        );
        volume_id
    }

    pub fn add_pool(&self, name: &str, node: &str, disk: &str, pool_state: PoolState) {
        let mut state = self.state.lock();
        state.pools.insert(
            name.to_string(),
            PoolEntry {
                pool: Pool {
                    name: name.to_string(),
                    node: node.to_string(),
                    disks: vec![disk.to_string()],
                    state: pool_state,
                    capacity: POOL_CAPACITY,
                    used: 0,
                },
                settle_reads: 0,
                pending_delete: false,
            },
        );
    }

    pub fn add_pod(&self, namespace: &str, pod: &str) {
        self.state
            .lock()
            .pods
            .insert((namespace.to_string(), pod.to_string()));
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    pub fn set_nexus_state(&self, id: &VolumeId, nexus_state: NexusState) {
        self.with_volume(id, |v| {
            if let Some(nexus) = v.nexus.as_mut() {
                nexus.state = nexus_state;
            }
        });
    }

    pub fn set_volume_state(&self, id: &VolumeId, volume_state: VolumeState) {
        self.with_volume(id, |v| v.state = volume_state);
    }

    pub fn set_child_state(&self, id: &VolumeId, index: usize, child_state: ChildState) {
        self.with_volume(id, |v| {
            if let Some(child) = v.nexus.as_mut().and_then(|n| n.children.get_mut(index)) {
                child.state = child_state;
            }
        });
    }

    /// Apply `f` to the volume immediately.
    pub fn with_volume(&self, id: &VolumeId, f: impl FnOnce(&mut Volume)) {
        if let Some(entry) = self.state.lock().volumes.get_mut(id) {
            f(&mut entry.volume);
        }
    }

    /// Apply `f` just before the `nth` (1-based) read of the volume is answered.
    pub fn mutate_on_read(
        &self,
        id: &VolumeId,
        nth: usize,
        f: impl FnOnce(&mut Volume) + Send + 'static,
    ) {
        if let Some(entry) = self.state.lock().volumes.get_mut(id) {
            entry.hooks.push(ReadHook {
                remaining: nth.max(1),
                apply: Box::new(f),
            });
        }
    }

    /// Number of volume reads a rebuild stays in progress for.
    pub fn set_rebuild_reads(&self, reads: usize) {
        self.state.lock().rebuild_reads = reads;
    }

    /// Number of pool reads a newly created pool stays Pending for.
    pub fn set_pool_settle_reads(&self, reads: usize) {
        self.state.lock().pool_settle_reads = reads;
    }

    pub fn set_pool_used(&self, name: &str, used: u64) {
        if let Some(entry) = self.state.lock().pools.get_mut(name) {
            entry.pool.used = used;
        }
    }

    pub fn set_pool_state(&self, name: &str, pool_state: PoolState) {
        if let Some(entry) = self.state.lock().pools.get_mut(name) {
            entry.pool.state = pool_state;
        }
    }

    /// Fail the next `count` control-plane reads with `status`.
    pub fn fail_next_reads(&self, count: usize, status: u16) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.read_failures.push_back(status);
        }
    }

    /// Answer the next fio invocation with `output` instead of simulating it.
    pub fn push_fio_output(&self, output: ExecOutput) {
        self.state.lock().fio_outputs.push_back(output);
    }

    /// Delay every pod exec by `delay`.
    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().exec_delay = Some(delay);
    }

    pub fn set_replica_checksum(&self, replica_uuid: &str, checksum: &str) {
        self.state
            .lock()
            .replica_checksums
            .insert(replica_uuid.to_string(), checksum.to_string());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current volume, without counting as a read.
    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.state.lock().volumes.get(id).map(|e| e.volume.clone())
    }

    /// Current pool, without counting as a read.
    pub fn pool(&self, name: &str) -> Option<Pool> {
        self.state.lock().pools.get(name).map(|e| e.pool.clone())
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.state.lock().pools.keys().cloned().collect()
    }

    pub fn node_ip(&self, node: &str) -> Option<String> {
        self.state.lock().node_ip(node)
    }

    pub fn node_label(&self, node: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .labels
            .get(node)
            .and_then(|l| l.get(key).cloned())
    }

    pub fn is_powered_off(&self, node: &str) -> bool {
        self.state.lock().powered_off.contains(node)
    }

    pub fn dropped_connections(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .dropped_connections
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every mutating call, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

fn child_for(replica: &Replica, nexus_node: &str, state: ChildState) -> Child {
    let uri = if replica.node == nexus_node {
        format!("bdev:///{}?uuid={}", replica.uuid, replica.uuid)
    } else {
        replica.uri.clone()
    };
    Child {
        uri,
        state,
        node: Some(replica.node.clone()),
    }
}

fn uuid_from_uri(uri: &str) -> Option<&str> {
    uri.split_once("uuid=").map(|(_, rest)| rest.split('&').next().unwrap_or(rest))
}

fn arg_after<'a>(command: &'a str, flag: &str) -> Option<&'a str> {
    let mut parts = command.split_whitespace();
    while let Some(part) = parts.next() {
        if part == flag {
            return parts.next();
        }
        if let Some(value) = part.strip_prefix(flag) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value);
            }
            // short options take their value glued on: -nNQN
            if flag.len() == 2 && !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

// =============================================================================
// Control Plane
// =============================================================================

#[async_trait]
impl ControlPlane for InMemoryCluster {
    fn version(&self) -> ControlPlaneVersion {
        self.version
    }

    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>> {
        let mut state = self.state.lock();
        state.check_read("volume")?;
        Ok(state.volumes.get_mut(volume_id).map(|entry| {
            entry.on_read();
            entry.volume.clone()
        }))
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let mut state = self.state.lock();
        state.check_read("volumes")?;
        Ok(state.volumes.values().map(|e| e.volume.clone()).collect())
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        self.record(format!("delete_volume {}", volume_id));
        let mut state = self.state.lock();
        let entry = state
            .volumes
            .remove(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
        for replica in &entry.volume.replicas {
            state.release_replica(replica, entry.volume.size_bytes);
        }
        Ok(())
    }

    async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()> {
        self.record(format!("set_replica_count {} {}", volume_id, count));
        let mut state = self.state.lock();
        let rebuild_reads = state.rebuild_reads;
        let mut entry = state
            .volumes
            .remove(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;

        let result = (|| {
            if count == 0 {
                return Err(Error::ControlPlane {
                    status: 400,
                    message: "replica count must be at least 1".into(),
                });
            }
            let size = entry.volume.size_bytes;
            let nexus_node = entry.volume.nexus.as_ref().map(|n| n.node.clone());
            let mut added = false;

            while (entry.volume.replicas.len() as u32) < count {
                let node = state.free_node(&entry.volume, &[]).ok_or_else(|| {
                    Error::ControlPlane {
                        status: 507,
                        message: "not enough suitable pools available".into(),
                    }
                })?;
                let replica = state.new_replica(&node, size);
                if let (Some(nexus), Some(nexus_node)) =
                    (entry.volume.nexus.as_mut(), nexus_node.as_deref())
                {
                    nexus
                        .children
                        .push(child_for(&replica, nexus_node, ChildState::Degraded));
                }
                entry.volume.replicas.push(replica);
                added = true;
            }

            while (entry.volume.replicas.len() as u32) > count {
                // drop the newest replica that is not local to the nexus
                let index = entry
                    .volume
                    .replicas
                    .iter()
                    .rposition(|r| Some(&r.node) != nexus_node.as_ref())
                    .unwrap_or(entry.volume.replicas.len() - 1);
                let replica = entry.volume.replicas.remove(index);
                if let Some(nexus) = entry.volume.nexus.as_mut() {
                    nexus
                        .children
                        .retain(|c| uuid_from_uri(&c.uri) != Some(replica.uuid.as_str()));
                }
                state.release_replica(&replica, size);
            }

            entry.volume.desired_replicas = count;
            if added && entry.volume.nexus.is_some() {
                entry.start_rebuild(rebuild_reads);
            }
            Ok(())
        })();

        state.volumes.insert(volume_id.clone(), entry);
        result
    }

    async fn get_nexus(&self, volume_id: &VolumeId) -> Result<Option<Nexus>> {
        let mut state = self.state.lock();
        state.check_read("nexus")?;
        let entry = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
        entry.on_read();
        Ok(entry.volume.nexus.clone())
    }

    async fn get_replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>> {
        let mut state = self.state.lock();
        state.check_read("replicas")?;
        let entry = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
        entry.on_read();
        Ok(entry.volume.replicas.clone())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<Pool>> {
        let mut state = self.state.lock();
        state.check_read("pool")?;
        let ClusterState {
            pools, powered_off, ..
        } = &mut *state;
        Ok(pools.get_mut(name).map(|entry| {
            ClusterState::settle_pool(entry, powered_off);
            entry.pool.clone()
        }))
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let mut state = self.state.lock();
        state.check_read("pools")?;
        let ClusterState {
            pools, powered_off, ..
        } = &mut *state;
        Ok(pools
            .values_mut()
            .map(|entry| {
                ClusterState::settle_pool(entry, powered_off);
                entry.pool.clone()
            })
            .collect())
    }

    async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()> {
        self.record(format!("create_pool {} {} {}", name, node, disks.join(",")));
        let mut state = self.state.lock();
        if state.pools.contains_key(name) {
            return Err(Error::ControlPlane {
                status: 409,
                message: format!("pool {} already exists", name),
            });
        }
        if state.node_ip(node).is_none() {
            return Err(Error::not_found("node", node));
        }
        let settle_reads = state.pool_settle_reads;
        state.pools.insert(
            name.to_string(),
            PoolEntry {
                pool: Pool {
                    name: name.to_string(),
                    node: node.to_string(),
                    disks: disks.to_vec(),
                    state: if settle_reads == 0 {
                        PoolState::Online
                    } else {
                        PoolState::Pending
                    },
                    capacity: POOL_CAPACITY,
                    used: 0,
                },
                settle_reads,
                pending_delete: false,
            },
        );
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.record(format!("delete_pool {}", name));
        let mut state = self.state.lock();
        let (node, used) = match state.pools.get(name) {
            Some(entry) => (entry.pool.node.clone(), entry.pool.used),
            None => return Err(Error::not_found("pool", name)),
        };
        if used > 0 {
            return Err(Error::ControlPlane {
                status: 409,
                message: format!("pool {} still has {} bytes of replicas", name, used),
            });
        }
        if state.powered_off.contains(&node) {
            if let Some(entry) = state.pools.get_mut(name) {
                entry.pending_delete = true;
            }
        } else {
            state.pools.remove(name);
        }
        Ok(())
    }

    async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        let mut state = self.state.lock();
        state.check_read("nodes")?;
        Ok(state
            .storage_nodes
            .iter()
            .map(|(name, s)| StorageNode {
                name: name.clone(),
                state: *s,
            })
            .collect())
    }

    async fn get_storage_node(&self, name: &str) -> Result<Option<StorageNode>> {
        let mut state = self.state.lock();
        state.check_read("node")?;
        Ok(state.storage_nodes.get(name).map(|s| StorageNode {
            name: name.to_string(),
            state: *s,
        }))
    }
}

// =============================================================================
// Nexus Control
// =============================================================================

#[async_trait]
impl NexusControl for InMemoryCluster {
    async fn fault_child(&self, nexus: &Nexus, child_uri: &str) -> Result<()> {
        self.record(format!("fault_child {} {}", nexus.uuid, child_uri));
        let mut state = self.state.lock();
        let rebuild_reads = state.rebuild_reads;
        let id = state
            .volumes
            .iter()
            .find(|(_, e)| e.volume.nexus.as_ref().is_some_and(|n| n.uuid == nexus.uuid))
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::not_found("nexus", nexus.uuid.as_str()))?;
        let mut entry = state
            .volumes
            .remove(&id)
            .ok_or_else(|| Error::not_found("volume", id.as_str()))?;

        let result = (|| {
            let nexus_node = entry
                .volume
                .nexus
                .as_ref()
                .map(|n| n.node.clone())
                .unwrap_or_default();
            let children = &mut entry
                .volume
                .nexus
                .as_mut()
                .ok_or_else(|| Error::not_found("nexus", nexus.uuid.as_str()))?
                .children;
            let index = children
                .iter()
                .position(|c| c.uri == child_uri)
                .ok_or_else(|| Error::not_found("child", child_uri))?;
            let child = children.remove(index);

            let size = entry.volume.size_bytes;
            let lost_node = child.node.clone().unwrap_or_default();
            if let Some(pos) = entry
                .volume
                .replicas
                .iter()
                .position(|r| Some(r.uuid.as_str()) == uuid_from_uri(&child.uri))
            {
                let replica = entry.volume.replicas.remove(pos);
                state.release_replica(&replica, size);
            }

            // the control plane replaces the lost replica, elsewhere if it can
            let node = state
                .free_node(&entry.volume, std::slice::from_ref(&lost_node))
                .unwrap_or(lost_node);
            let replica = state.new_replica(&node, size);
            if let Some(nexus) = entry.volume.nexus.as_mut() {
                nexus
                    .children
                    .push(child_for(&replica, &nexus_node, ChildState::Degraded));
            }
            entry.volume.replicas.push(replica);
            entry.start_rebuild(rebuild_reads);
            Ok(())
        })();

        state.volumes.insert(id, entry);
        result
    }
}

// =============================================================================
// Cluster Objects
// =============================================================================

#[async_trait]
impl ClusterObjects for InMemoryCluster {
    async fn node_locations(&self) -> Result<Vec<NodeLocation>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .iter()
            .map(|n| NodeLocation {
                storage_node: state
                    .labels
                    .get(&n.name)
                    .and_then(|l| l.get(ENGINE_LABEL_KEY))
                    .is_some_and(|v| v == ENGINE_LABEL_VALUE),
                ..n.clone()
            })
            .collect())
    }

    async fn set_node_label(&self, node: &str, key: &str, value: Option<&str>) -> Result<()> {
        self.record(format!("label {} {}={}", node, key, value.unwrap_or("-")));
        let mut state = self.state.lock();
        let labels = state
            .labels
            .get_mut(node)
            .ok_or_else(|| Error::not_found("node", node))?;
        match value {
            Some(v) => {
                labels.insert(key.to_string(), v.to_string());
            }
            None => {
                labels.remove(key);
            }
        }
        if key == ENGINE_LABEL_KEY {
            let node_state = if state.engine_running(node) {
                NodeState::Online
            } else {
                NodeState::Offline
            };
            state.storage_nodes.insert(node.to_string(), node_state);
        }
        Ok(())
    }

    async fn engine_pod_running_on_node(&self, node: &str) -> Result<bool> {
        Ok(self.state.lock().engine_running(node))
    }

    async fn is_pod_running(&self, namespace: &str, pod: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .pods
            .contains(&(namespace.to_string(), pod.to_string())))
    }
}

// =============================================================================
// Pod Exec
// =============================================================================

#[async_trait]
impl PodExec for InMemoryCluster {
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<ExecOutput> {
        let line = command.join(" ");
        self.record(format!("exec {}/{} {}", namespace, pod, line));

        let delay = self.state.lock().exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if !state
            .pods
            .contains(&(namespace.to_string(), pod.to_string()))
        {
            return Err(Error::not_found("pod", format!("{}/{}", namespace, pod)));
        }
        if command.first().map(String::as_str) != Some("fio") {
            return Ok(ExecOutput {
                success: true,
                exit_code: Some(0),
                output: String::new(),
            });
        }
        if let Some(output) = state.fio_outputs.pop_front() {
            return Ok(output);
        }

        let algorithm = arg_after(&line, "--verify").unwrap_or("crc32").to_string();
        let writing = line.contains("--rw=randwrite");
        if writing {
            state.written.insert(pod.to_string(), algorithm);
            return Ok(ExecOutput {
                success: true,
                exit_code: Some(0),
                output: "benchtest: (groupid=0, jobs=1): err= 0".to_string(),
            });
        }

        match state.written.get(pod) {
            Some(tag) if *tag == algorithm => Ok(ExecOutput {
                success: true,
                exit_code: Some(0),
                output: "benchtest: (groupid=0, jobs=1): err= 0".to_string(),
            }),
            _ => Ok(ExecOutput {
                success: false,
                exit_code: Some(1),
                output: format!(
                    "verify: bad magic header 0, wanted acca at file /dev/sdm offset 4096, length 4096 ({})",
                    algorithm
                ),
            }),
        }
    }
}

// =============================================================================
// Node Agent
// =============================================================================

#[async_trait]
impl NodeAgent for InMemoryCluster {
    async fn ungraceful_reboot(&self, node_ip: &str) -> Result<()> {
        self.record(format!("agent ungraceful_reboot {}", node_ip));
        self.is_reachable(node_ip).await
    }

    async fn drop_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()> {
        self.record(format!("agent drop {} {}", node_ip, nodes.join(",")));
        let mut state = self.state.lock();
        let node = state
            .node_by_ip(node_ip)
            .ok_or_else(|| agent_error(node_ip, "no such host"))?;
        state
            .dropped_connections
            .entry(node)
            .or_default()
            .extend(nodes.iter().cloned());
        Ok(())
    }

    async fn accept_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()> {
        self.record(format!("agent accept {} {}", node_ip, nodes.join(",")));
        let mut state = self.state.lock();
        let node = state
            .node_by_ip(node_ip)
            .ok_or_else(|| agent_error(node_ip, "no such host"))?;
        if let Some(dropped) = state.dropped_connections.get_mut(&node) {
            for n in nodes {
                dropped.remove(n);
            }
        }
        Ok(())
    }

    async fn is_reachable(&self, node_ip: &str) -> Result<()> {
        let state = self.state.lock();
        match state.node_by_ip(node_ip) {
            Some(node) if !state.powered_off.contains(&node) => Ok(()),
            Some(_) => Err(agent_error(node_ip, "host is powered off")),
            None => Err(agent_error(node_ip, "no such host")),
        }
    }

    async fn exec(&self, node_ip: &str, command: &str) -> Result<String> {
        self.record(format!("agent exec {} {}", node_ip, command));
        self.is_reachable(node_ip).await?;
        let mut state = self.state.lock();

        if command.starts_with("nvme connect") {
            let nqn = arg_after(command, "-n").ok_or_else(|| agent_error(node_ip, "missing nqn"))?;
            let device = format!("/dev/nvme{}n1", state.connected.len() + 1);
            state.connected.insert(nqn.to_string(), device);
            return Ok(String::new());
        }
        if command.starts_with("nvme list") {
            let mut out = String::from(
                "Node             SN                   Model\n---------------- -------------------- ----------------------------------------\n/dev/nvme0n1     S4EWNX0N123456       Samsung SSD 970 EVO Plus\n",
            );
            for (nqn, device) in &state.connected {
                out.push_str(&format!(
                    "{}     {}       Mayastor NVMe controller\n",
                    device,
                    &nqn[nqn.len().saturating_sub(8)..]
                ));
            }
            return Ok(out);
        }
        if command.starts_with("nvme disconnect") {
            let nqn = arg_after(command, "-n").ok_or_else(|| agent_error(node_ip, "missing nqn"))?;
            state.connected.remove(nqn);
            return Ok(format!("NQN:{} disconnected 1 controller(s)", nqn));
        }
        if let Some(target) = command.strip_prefix("cksum ") {
            let target = target.trim();
            let base = target.strip_suffix("p2").unwrap_or(target);
            let nqn = state
                .connected
                .iter()
                .find(|(_, device)| device.as_str() == base)
                .map(|(nqn, _)| nqn.clone())
                .ok_or_else(|| agent_error(node_ip, format!("cksum: {}: No such file", target)))?;
            let uuid = nqn.rsplit(':').next().unwrap_or(&nqn);
            let sum = state
                .replica_checksums
                .get(uuid)
                .cloned()
                .unwrap_or_else(|| DEFAULT_REPLICA_CHECKSUM.to_string());
            return Ok(format!("{} {} {}", sum, VOLUME_SIZE, target));
        }
        if command.starts_with("ls /dev") {
            let mut entries = vec!["nvme0".to_string(), "nvme0n1".to_string(), "sda".to_string()];
            for device in state.connected.values() {
                let name = device.trim_start_matches("/dev/");
                entries.push(name.to_string());
                entries.push(format!("{}p2", name));
            }
            return Ok(entries.join("\n"));
        }
        Ok(String::new())
    }
}

fn agent_error(node: &str, reason: impl Into<String>) -> Error {
    Error::Agent {
        node: node.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// Platform
// =============================================================================

#[async_trait]
impl Platform for InMemoryCluster {
    async fn power_on_node(&self, node: &str) -> Result<()> {
        self.record(format!("power_on {}", node));
        let mut state = self.state.lock();
        if state.node_ip(node).is_none() {
            return Err(platform_error(node));
        }
        state.apply_power_on(node);
        Ok(())
    }

    async fn power_off_node(&self, node: &str) -> Result<()> {
        self.record(format!("power_off {}", node));
        let mut state = self.state.lock();
        if state.node_ip(node).is_none() {
            return Err(platform_error(node));
        }
        state.apply_power_off(node);
        Ok(())
    }

    async fn node_power_state(&self, node: &str) -> Result<PowerState> {
        let state = self.state.lock();
        if state.node_ip(node).is_none() {
            return Err(platform_error(node));
        }
        Ok(if state.powered_off.contains(node) {
            PowerState::Off
        } else {
            PowerState::Running
        })
    }
}

fn platform_error(node: &str) -> Error {
    Error::Platform {
        node: node.to_string(),
        reason: "server not found".to_string(),
    }
}
