//! Proxmox cluster detection probe.
//!
//! Before inserting a new PVE instance, enrollment asks the node whether it
//! belongs to a cluster. Nodes of an already-configured cluster are merged
//! into that instance's endpoint set instead of becoming duplicates.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// A node reported by `/cluster/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Cluster-internal node name
    pub name: String,
    /// Node IP as reported by the cluster, when present
    pub ip: Option<String>,
}

/// Result of a successful cluster probe.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Member nodes
    pub nodes: Vec<ClusterNode>,
}

/// Abstraction over the probe so enrollment logic is testable without a
/// live Proxmox node.
#[async_trait::async_trait]
pub trait ClusterProber: Send + Sync + 'static {
    /// Ask the node for its cluster membership. `None` means standalone,
    /// unreachable, or not a PVE node.
    async fn probe(
        &self,
        host_url: &str,
        token_id: &str,
        token_value: &str,
        verify_tls: bool,
    ) -> Option<ClusterInfo>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ip: Option<String>,
}

/// Probe over the Proxmox HTTP API.
pub struct HttpClusterProber {
    timeout: Duration,
}

impl HttpClusterProber {
    /// Probe with the given per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpClusterProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl ClusterProber for HttpClusterProber {
    async fn probe(
        &self,
        host_url: &str,
        token_id: &str,
        token_value: &str,
        verify_tls: bool,
    ) -> Option<ClusterInfo> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .ok()?;

        let url = format!("{host_url}/api2/json/cluster/status");
        let response = client
            .get(&url)
            .header(
                "Authorization",
                format!("PVEAPIToken={token_id}={token_value}"),
            )
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Cluster probe rejected");
            return None;
        }

        let status: StatusResponse = response.json().await.ok()?;

        let name = status
            .data
            .iter()
            .find(|e| e.kind == "cluster")
            .and_then(|e| e.name.clone())?;

        let nodes = status
            .data
            .iter()
            .filter(|e| e.kind == "node")
            .filter_map(|e| {
                e.name.clone().map(|name| ClusterNode {
                    name,
                    ip: e.ip.clone(),
                })
            })
            .collect();

        debug!(cluster = %name, "Node reports cluster membership");
        Some(ClusterInfo { name, nodes })
    }
}
