//! Kubernetes Cluster Adapter
//!
//! Implements the `ClusterObjects` port over the Kubernetes API: node
//! addresses and role labels, engine scheduling labels, and pod phases.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::domain::ports::{ClusterObjects, NodeLocation, ENGINE_LABEL_KEY, ENGINE_LABEL_VALUE};
use crate::error::{Error, Result};

/// Label selecting storage-engine pods.
const ENGINE_POD_SELECTOR: &str = "app=mayastor";

const MASTER_ROLE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];

/// Kubernetes-backed implementation of [`ClusterObjects`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    /// Namespace the storage engine runs in
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn nodes_api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn location_of(node: &Node) -> Option<NodeLocation> {
        let name = node.metadata.name.clone()?;
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let ip_address = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
            .map(|a| a.address.clone())
            .unwrap_or_default();

        Some(NodeLocation {
            name,
            ip_address,
            storage_node: labels.get(ENGINE_LABEL_KEY).map(String::as_str) == Some(ENGINE_LABEL_VALUE),
            master_node: MASTER_ROLE_LABELS.iter().any(|l| labels.contains_key(*l)),
        })
    }

    fn is_running(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Running")
    }
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl ClusterObjects for KubeCluster {
    #[instrument(skip(self))]
    async fn node_locations(&self) -> Result<Vec<NodeLocation>> {
        let nodes = self.nodes_api().list(&ListParams::default()).await?;
        Ok(nodes.items.iter().filter_map(Self::location_of).collect())
    }

    #[instrument(skip(self))]
    async fn set_node_label(&self, node: &str, key: &str, value: Option<&str>) -> Result<()> {
        // A null value removes the label under merge-patch semantics
        let mut labels = serde_json::Map::new();
        labels.insert(key.to_string(), value.map_or(Value::Null, Value::from));
        let patch = json!({ "metadata": { "labels": labels } });
        let params = PatchParams::apply("replica-sentinel");
        match self
            .nodes_api()
            .patch(node, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                info!(node, key, value = ?value, "Updated node label");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::not_found("node", node)),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self))]
    async fn engine_pod_running_on_node(&self, node: &str) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default()
            .labels(ENGINE_POD_SELECTOR)
            .fields(&format!("spec.nodeName={}", node));
        let pods = api.list(&params).await?;
        let running = pods.items.iter().any(Self::is_running);
        debug!(node, pods = pods.items.len(), running, "Checked engine pods");
        Ok(running)
    }

    #[instrument(skip(self))]
    async fn is_pod_running(&self, namespace: &str, pod: &str) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(pod).await {
            Ok(p) => Ok(Self::is_running(&p)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, labels: serde_json::Value, ip: &str) -> Node {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "name": name, "labels": labels },
            "status": {
                "addresses": [
                    { "type": "Hostname", "address": name },
                    { "type": "InternalIP", "address": ip }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_location_reads_roles_and_ip() {
        let worker = node(
            "node-2",
            json!({ "openebs.io/engine": "mayastor", "kubernetes.io/hostname": "node-2" }),
            "10.0.0.12",
        );
        let loc = KubeCluster::location_of(&worker).unwrap();
        assert_eq!(loc.ip_address, "10.0.0.12");
        assert!(loc.storage_node);
        assert!(!loc.master_node);

        let master = node(
            "node-1",
            json!({ "node-role.kubernetes.io/control-plane": "" }),
            "10.0.0.11",
        );
        let loc = KubeCluster::location_of(&master).unwrap();
        assert!(loc.master_node);
        assert!(!loc.storage_node);
    }

    #[test]
    fn test_engine_label_must_match_value() {
        let n = node("node-3", json!({ "openebs.io/engine": "none" }), "10.0.0.13");
        assert!(!KubeCluster::location_of(&n).unwrap().storage_node);
    }

    #[test]
    fn test_pod_phase() {
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "fio" },
            "status": { "phase": "Pending" }
        }))
        .unwrap();
        assert!(!KubeCluster::is_running(&pod));

        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "fio" },
            "status": { "phase": "Running" }
        }))
        .unwrap();
        assert!(KubeCluster::is_running(&pod));
    }
}
