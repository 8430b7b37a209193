//! REST control plane
//!
//! Implements the `ControlPlane` and `NexusControl` ports for the 1.x
//! control plane. State is read from the REST API exposed on every node;
//! pools are created and deleted through the `DiskPool` resource, which the
//! pool operator reconciles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams};
use reqwest::{Client as HttpClient, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::SentinelConfig;
use crate::crd::{uuid_from_uri, DiskPool};
use crate::domain::ports::{
    Child, ControlPlane, ControlPlaneVersion, Nexus, NexusControl, Pool, PoolState, Replica,
    StateTokens, StorageNode, Volume, VolumeId,
};
use crate::error::{Error, Result};

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct VolumeDto {
    spec: VolumeSpecDto,
    #[serde(default)]
    state: VolumeStateDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VolumeSpecDto {
    #[serde(default)]
    num_replicas: u32,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    target: Option<SpecTargetDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SpecTargetDto {
    #[serde(default)]
    node: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VolumeStateDto {
    #[serde(default)]
    status: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    target: Option<TargetDto>,
    #[serde(default)]
    replica_topology: BTreeMap<String, ReplicaTopologyDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TargetDto {
    #[serde(default)]
    children: Vec<ChildDto>,
    #[serde(default, rename = "deviceUri")]
    device_uri: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChildDto {
    #[serde(default)]
    state: String,
    uri: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReplicaTopologyDto {
    #[serde(default)]
    node: String,
    #[serde(default)]
    pool: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplicaDto {
    uuid: String,
    #[serde(default)]
    node: String,
    #[serde(default)]
    pool: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PoolDto {
    id: String,
    #[serde(default)]
    spec: Option<PoolSpecDto>,
    #[serde(default)]
    state: Option<PoolStateDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PoolSpecDto {
    #[serde(default)]
    disks: Vec<String>,
    #[serde(default)]
    node: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PoolStateDto {
    #[serde(default)]
    capacity: u64,
    #[serde(default)]
    disks: Vec<String>,
    #[serde(default)]
    node: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    used: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeDto {
    id: String,
    #[serde(default)]
    state: Option<NodeStateDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NodeStateDto {
    #[serde(default)]
    status: String,
}

// =============================================================================
// Conversion
// =============================================================================

/// Node of the replica behind a child, found through the child URI's uuid.
fn child_node(uri: &str, topology: &BTreeMap<String, ReplicaTopologyDto>) -> Option<String> {
    topology
        .get(&uuid_from_uri(uri))
        .map(|t| t.node.clone())
        .filter(|n| !n.is_empty())
}

fn replica_from(dto: ReplicaDto) -> Replica {
    Replica {
        offline: dto.state != StateTokens::V1.child_online,
        uuid: dto.uuid,
        node: dto.node,
        pool: dto.pool,
        uri: dto.uri,
    }
}

/// Replica known only from the volume topology.
fn replica_from_topology(uuid: &str, topo: &ReplicaTopologyDto) -> Replica {
    Replica {
        uuid: uuid.to_string(),
        node: topo.node.clone(),
        pool: topo.pool.clone(),
        uri: String::new(),
        offline: topo.state != StateTokens::V1.child_online,
    }
}

fn volume_from(dto: VolumeDto, replicas: Vec<Replica>) -> Volume {
    let tokens = &StateTokens::V1;
    let topology = &dto.state.replica_topology;
    let nexus = dto
        .state
        .target
        .as_ref()
        .filter(|t| !t.node.is_empty() || !t.children.is_empty())
        .map(|t| Nexus {
            uuid: t.uuid.clone(),
            node: t.node.clone(),
            state: tokens.nexus_state(&t.state),
            device_uri: t.device_uri.clone(),
            children: t
                .children
                .iter()
                .map(|c| Child {
                    uri: c.uri.clone(),
                    state: tokens.child_state(&c.state),
                    node: child_node(&c.uri, topology),
                })
                .collect(),
        });

    Volume {
        id: VolumeId::new(dto.spec.uuid.clone()),
        desired_replicas: dto.spec.num_replicas,
        state: tokens.volume_state(&dto.state.status),
        size_bytes: if dto.state.size > 0 {
            dto.state.size
        } else {
            dto.spec.size
        },
        target_node: dto
            .spec
            .target
            .map(|t| t.node)
            .filter(|n| !n.is_empty()),
        nexus,
        replicas,
    }
}

fn pool_from(dto: PoolDto) -> Pool {
    let spec = dto.spec.unwrap_or_default();
    match dto.state {
        Some(state) => Pool {
            name: dto.id,
            node: if state.node.is_empty() { spec.node } else { state.node },
            disks: if state.disks.is_empty() { spec.disks } else { state.disks },
            state: StateTokens::V1.pool_state(&state.status),
            capacity: state.capacity,
            used: state.used,
        },
        // No runtime state: the node hosting the pool is not reporting
        None => Pool {
            name: dto.id,
            node: spec.node,
            disks: spec.disks,
            state: PoolState::Unknown,
            capacity: 0,
            used: 0,
        },
    }
}

fn node_from(dto: NodeDto) -> StorageNode {
    let status = dto.state.map(|s| s.status).unwrap_or_default();
    StorageNode {
        state: StateTokens::V1.node_state(&status),
        name: dto.id,
    }
}

// =============================================================================
// Client
// =============================================================================

/// Control plane reached over its REST API.
///
/// Each request is tried against the configured node addresses in order;
/// the first node that answers serves it.
#[derive(Clone)]
pub struct RestControlPlane {
    http: HttpClient,
    kube: kube::Client,
    namespace: String,
    endpoints: Vec<String>,
    port: u16,
}

impl RestControlPlane {
    /// Build a client from the run configuration.
    pub fn new(kube: kube::Client, config: &SentinelConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Self::with_http(http, kube, config)
    }

    pub fn with_http(http: HttpClient, kube: kube::Client, config: &SentinelConfig) -> Result<Self> {
        if config.rest_endpoints.is_empty() {
            return Err(Error::Config(
                "rest_endpoints must name at least one node for the REST control plane".into(),
            ));
        }
        Ok(Self {
            http,
            kube,
            namespace: config.namespace.clone(),
            endpoints: config.rest_endpoints.clone(),
            port: config.rest_port,
        })
    }

    fn disk_pools_api(&self) -> Api<DiskPool> {
        Api::namespaced(self.kube.clone(), &self.namespace)
    }

    fn url(&self, endpoint: &str, path: &str) -> String {
        format!("http://{}:{}/v0{}", endpoint, self.port, path)
    }

    /// Send a request to the first endpoint that accepts the connection.
    async fn send(&self, method: Method, path: &str) -> Result<Response> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            let url = self.url(endpoint, path);
            match self.http.request(method.clone(), &url).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() => {
                    warn!(endpoint = %endpoint, error = %e, "Control plane endpoint unreachable");
                    last_error = Some(e);
                }
                Err(e) => return Err(Error::Http(e)),
            }
        }
        match last_error {
            Some(e) => Err(Error::Http(e)),
            None => Err(Error::Config("no REST endpoints configured".into())),
        }
    }

    async fn status_error(response: Response) -> Error {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Error::ControlPlane { status, message }
    }

    /// GET a resource; `None` on 404.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(Method::GET, path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let body = response
            .json()
            .await
            .map_err(|e| Error::ResponseParse(e.to_string()))?;
        Ok(Some(body))
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        Ok(self.get_json(path).await?.unwrap_or_default())
    }

    /// Issue a request whose response body is not needed.
    async fn call(&self, method: Method, path: &str, kind: &'static str, name: &str) -> Result<()> {
        let response = self.send(method, path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::not_found(kind, name));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    /// Replicas listed in a volume's topology, with URIs from the replica API.
    async fn replicas_of(&self, dto: &VolumeDto) -> Result<Vec<Replica>> {
        let mut replicas = Vec::with_capacity(dto.state.replica_topology.len());
        for (uuid, topo) in &dto.state.replica_topology {
            let replica = match self
                .get_json::<ReplicaDto>(&format!("/replicas/{}", uuid))
                .await?
            {
                Some(r) => replica_from(r),
                None => replica_from_topology(uuid, topo),
            };
            replicas.push(replica);
        }
        Ok(replicas)
    }

    async fn volume_dto(&self, volume_id: &VolumeId) -> Result<Option<VolumeDto>> {
        self.get_json(&format!("/volumes/{}", volume_id)).await
    }
}

impl std::fmt::Debug for RestControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestControlPlane")
            .field("namespace", &self.namespace)
            .field("endpoints", &self.endpoints)
            .field("port", &self.port)
            .finish()
    }
}

#[async_trait]
impl ControlPlane for RestControlPlane {
    fn version(&self) -> ControlPlaneVersion {
        ControlPlaneVersion::V1
    }

    #[instrument(skip(self))]
    async fn get_volume(&self, volume_id: &VolumeId) -> Result<Option<Volume>> {
        match self.volume_dto(volume_id).await? {
            Some(dto) => {
                let replicas = self.replicas_of(&dto).await?;
                Ok(Some(volume_from(dto, replicas)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let dtos: Vec<VolumeDto> = self.get_list("/volumes").await?;
        let mut volumes = Vec::with_capacity(dtos.len());
        for dto in dtos {
            let replicas = self.replicas_of(&dto).await?;
            volumes.push(volume_from(dto, replicas));
        }
        Ok(volumes)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        self.call(
            Method::DELETE,
            &format!("/volumes/{}", volume_id),
            "volume",
            volume_id.as_str(),
        )
        .await?;
        info!(volume = %volume_id, "Requested volume deletion");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_replica_count(&self, volume_id: &VolumeId, count: u32) -> Result<()> {
        self.call(
            Method::PUT,
            &format!("/volumes/{}/replica_count/{}", volume_id, count),
            "volume",
            volume_id.as_str(),
        )
        .await?;
        debug!(volume = %volume_id, count, "Set replica count");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_nexus(&self, volume_id: &VolumeId) -> Result<Option<Nexus>> {
        let dto = self
            .volume_dto(volume_id)
            .await?
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
        Ok(volume_from(dto, Vec::new()).nexus)
    }

    #[instrument(skip(self))]
    async fn get_replicas(&self, volume_id: &VolumeId) -> Result<Vec<Replica>> {
        let dto = self
            .volume_dto(volume_id)
            .await?
            .ok_or_else(|| Error::not_found("volume", volume_id.as_str()))?;
        self.replicas_of(&dto).await
    }

    #[instrument(skip(self))]
    async fn get_pool(&self, name: &str) -> Result<Option<Pool>> {
        Ok(self
            .get_json::<PoolDto>(&format!("/pools/{}", name))
            .await?
            .map(pool_from))
    }

    #[instrument(skip(self))]
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let pools: Vec<PoolDto> = self.get_list("/pools").await?;
        Ok(pools.into_iter().map(pool_from).collect())
    }

    #[instrument(skip(self))]
    async fn create_pool(&self, name: &str, node: &str, disks: &[String]) -> Result<()> {
        let pool = DiskPool::new_for(name, node, disks);
        self.disk_pools_api()
            .create(&PostParams::default(), &pool)
            .await?;
        info!(pool = name, node, "Created DiskPool");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_pool(&self, name: &str) -> Result<()> {
        match self
            .disk_pools_api()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::not_found("pool", name)),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self))]
    async fn list_storage_nodes(&self) -> Result<Vec<StorageNode>> {
        let nodes: Vec<NodeDto> = self.get_list("/nodes").await?;
        Ok(nodes.into_iter().map(node_from).collect())
    }

    #[instrument(skip(self))]
    async fn get_storage_node(&self, name: &str) -> Result<Option<StorageNode>> {
        Ok(self
            .get_json::<NodeDto>(&format!("/nodes/{}", name))
            .await?
            .map(node_from))
    }
}

#[async_trait]
impl NexusControl for RestControlPlane {
    #[instrument(skip(self, nexus), fields(nexus = %nexus.uuid))]
    async fn fault_child(&self, nexus: &Nexus, child_uri: &str) -> Result<()> {
        let path = format!(
            "/nexuses/{}/children/{}",
            nexus.uuid,
            urlencoding::encode(child_uri)
        );
        self.call(Method::DELETE, &path, "child", child_uri).await?;
        info!(child = child_uri, node = %nexus.node, "Faulted nexus child");
        Ok(())
    }
}
