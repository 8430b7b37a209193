//! e2e Node Agent Client
//!
//! Implements the `NodeAgent` port against the privileged agent that runs on
//! every cluster node and performs host-level faults on request.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use tracing::{info, instrument};

use crate::config::FaultConfig;
use crate::domain::ports::NodeAgent;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct NodeList<'a> {
    nodes: &'a [String],
}

#[derive(Debug, Serialize)]
struct CmdRequest<'a> {
    cmd: &'a str,
}

/// HTTP client for the e2e node agent.
#[derive(Clone)]
pub struct E2eAgentClient {
    client: Client,
    port: u16,
}

impl E2eAgentClient {
    pub fn new(config: &FaultConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            port: config.agent_port,
        })
    }

    fn url(&self, node_ip: &str, path: &str) -> String {
        format!("http://{}:{}{}", node_ip, self.port, path)
    }

    /// Send a request and return the response body.
    async fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        node_ip: &str,
        path: &str,
        body: Option<&T>,
    ) -> Result<String> {
        let agent_error = |reason: String| Error::Agent {
            node: node_ip.to_string(),
            reason,
        };

        let mut request = self
            .client
            .request(method, self.url(node_ip, path))
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| agent_error(format!("{} {}", path, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| agent_error(format!("{} {}", path, e)))?;
        if !status.is_success() {
            return Err(agent_error(format!("{} returned {}: {}", path, status, text)));
        }
        Ok(text)
    }
}

impl std::fmt::Debug for E2eAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E2eAgentClient")
            .field("port", &self.port)
            .finish()
    }
}

#[async_trait]
impl NodeAgent for E2eAgentClient {
    #[instrument(skip(self))]
    async fn ungraceful_reboot(&self, node_ip: &str) -> Result<()> {
        info!(addr = node_ip, "Ungracefully rebooting node");
        self.send::<()>(Method::POST, node_ip, "/ungracefulReboot", None)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn drop_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()> {
        info!(addr = node_ip, ?nodes, "Dropping connections from nodes");
        self.send(
            Method::POST,
            node_ip,
            "/dropConnectionsFromNodes",
            Some(&NodeList { nodes }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn accept_connections_from_nodes(&self, node_ip: &str, nodes: &[String]) -> Result<()> {
        info!(addr = node_ip, ?nodes, "Accepting connections from nodes");
        self.send(
            Method::POST,
            node_ip,
            "/acceptConnectionsFromNodes",
            Some(&NodeList { nodes }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn is_reachable(&self, node_ip: &str) -> Result<()> {
        self.send::<()>(Method::GET, node_ip, "/", None).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exec(&self, node_ip: &str, command: &str) -> Result<String> {
        self.send(Method::POST, node_ip, "/exec", Some(&CmdRequest { cmd: command }))
            .await
    }
}
