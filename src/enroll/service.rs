//! Auto-registration of PVE/PBS nodes.
//!
//! The only path that mutates node configuration from untrusted origins, so
//! every request is authenticated with a one-shot setup code or a scoped API
//! token before anything else happens.
//!
//! Deduplication predicates run in a fixed priority order; reordering them
//! changes DHCP and agent-update semantics:
//!
//! 1. Exact host URL match → update in place
//! 2. Same server name and token id → DHCP address change, move the URL
//! 3. Agent-sourced, and the posted IP resolves from an existing instance's
//!    hostname → update in place, keep the configured hostname
//! 4. Otherwise insert; first probing for a cluster and merging into an
//!    existing instance of the same cluster instead of duplicating it

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::cluster::{ClusterInfo, ClusterProber, HttpClusterProber};
use super::host::{bare_host, normalize_host, probe_fingerprint};
use super::setup_codes::SetupCodeVault;
use crate::auth::audit::AuditEvent;
use crate::auth::tokens::{Scope, TokenRegistry};
use crate::persist::nodes::{
    ClusterEndpoint, ConfigStore, EnrollSource, MonitorFlags, NodeInstance, NodeKind,
};
use crate::server::events::ControlEvent;
use crate::{Error, Result};

/// `POST /api/auto-register` request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRegisterRequest {
    /// `pve` or `pbs`
    #[serde(rename = "type")]
    pub node_type: String,
    /// Host or URL the node is reachable at
    #[serde(default)]
    pub host: String,
    /// The node's own name
    #[serde(default)]
    pub server_name: Option<String>,
    /// Proxmox API token id created by the setup script
    #[serde(default)]
    pub token_id: Option<String>,
    /// Proxmox API token secret
    #[serde(default)]
    pub token_value: Option<String>,
    /// Pulse API token, as an alternative to a setup code
    #[serde(default)]
    pub auth_token: Option<String>,
    /// One-shot setup code
    #[serde(default)]
    pub setup_code: Option<String>,
    /// `script`, `agent` or `manual`
    #[serde(default)]
    pub source: Option<String>,
    /// Secure mode: ask Pulse to create the node credentials itself
    #[serde(default)]
    pub request_token: bool,
}

/// Successful registration summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentOutcome {
    /// Always true on the success path
    pub success: bool,
    /// `created`, `updated` or `merged`
    pub action: &'static str,
    /// Instance name after the operation
    pub name: String,
    /// Set when the node was folded into an existing cluster instance
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub merged: bool,
    /// Cluster name, when merged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    /// Endpoint count of the cluster instance, when merged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_endpoints: Option<usize>,
}

/// Credential that authorized an enrollment.
#[derive(Debug)]
pub enum EnrollCredential {
    /// Redeemed one-shot setup code (org attached at issue time)
    SetupCode {
        /// Organization the issuing admin was acting for
        org_id: Option<String>,
    },
    /// Scoped API token
    ApiToken {
        /// Token display name, for auditing
        name: String,
    },
}

/// DNS abstraction so agent-IP reconciliation is testable.
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync + 'static {
    /// Resolve a hostname to its addresses. IP literals resolve to themselves.
    async fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// System DNS resolver.
pub struct DnsResolver;

#[async_trait::async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![ip];
        }
        match tokio::net::lookup_host((host, 0u16)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

enum Placement {
    UpdateExact(usize),
    DhcpMove(usize),
    AgentHostMatch(usize),
    MergeCluster {
        index: usize,
        cluster: String,
    },
    Insert {
        cluster: Option<ClusterInfo>,
    },
}

/// Validates credentials, normalizes hosts, deduplicates and persists
/// enrollments.
pub struct EnrollmentService {
    store: Arc<ConfigStore>,
    setup_codes: Arc<SetupCodeVault>,
    registry: TokenRegistry,
    events: broadcast::Sender<ControlEvent>,
    prober: Arc<dyn ClusterProber>,
    resolver: Arc<dyn HostResolver>,
    probe_fingerprints: bool,
}

impl EnrollmentService {
    /// Build with production probes.
    #[must_use]
    pub fn new(
        store: Arc<ConfigStore>,
        setup_codes: Arc<SetupCodeVault>,
        registry: TokenRegistry,
        events: broadcast::Sender<ControlEvent>,
    ) -> Self {
        Self {
            store,
            setup_codes,
            registry,
            events,
            prober: Arc::new(HttpClusterProber::default()),
            resolver: Arc::new(DnsResolver),
            probe_fingerprints: true,
        }
    }

    /// Swap the cluster prober (tests).
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn ClusterProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Swap the DNS resolver (tests).
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Disable the TLS fingerprint probe (tests).
    #[must_use]
    pub fn without_fingerprint_probe(mut self) -> Self {
        self.probe_fingerprints = false;
        self
    }

    /// Authenticate an enrollment request.
    ///
    /// Precedence: a presented setup code is authoritative (and a bad one is
    /// fatal); otherwise an API token with `settings:write` or `host:report`
    /// is accepted; otherwise 401.
    pub async fn authenticate(
        &self,
        request: &AutoRegisterRequest,
        header_setup_code: Option<&str>,
        header_api_token: Option<&str>,
    ) -> Result<EnrollCredential> {
        let kind = NodeKind::parse(&request.node_type).ok_or_else(|| {
            Error::validation("invalid_type", "type must be \"pve\" or \"pbs\"")
        })?;

        if let Some(code) = request.setup_code.as_deref().or(header_setup_code) {
            let claims = self.setup_codes.redeem(code, kind)?;
            return Ok(EnrollCredential::SetupCode {
                org_id: claims.org_id,
            });
        }

        if let Some(token) = request.auth_token.as_deref().or(header_api_token) {
            if let Some(validated) = self.registry.validate(token).await {
                if validated.has_scope(Scope::SettingsWrite)
                    || validated.has_scope(Scope::HostReport)
                {
                    return Ok(EnrollCredential::ApiToken {
                        name: validated.record.name,
                    });
                }
                return Err(Error::MissingScope(Scope::HostReport.as_str().to_string()));
            }
            return Err(Error::Unauthorized);
        }

        Err(Error::Unauthorized)
    }

    /// Register a node after [`Self::authenticate`] accepted the caller.
    pub async fn register(
        &self,
        request: &AutoRegisterRequest,
        credential: &EnrollCredential,
        client_ip: Option<IpAddr>,
    ) -> Result<EnrollmentOutcome> {
        let kind = NodeKind::parse(&request.node_type).ok_or_else(|| {
            Error::validation("invalid_type", "type must be \"pve\" or \"pbs\"")
        })?;

        if request.request_token {
            // Creating node-side users and tokens needs the Proxmox API
            // client, which this service does not own.
            return Err(Error::Dependency(
                "Server-side credential provisioning is not available".to_string(),
            ));
        }

        let host_url = normalize_host(&request.host, kind)?;
        let token_id = request
            .token_id
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation("missing_token_id", "tokenId is required"))?;
        let token_value = request
            .token_value
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation("missing_token_value", "tokenValue is required"))?;

        let source = match request.source.as_deref() {
            Some("agent") => EnrollSource::Agent,
            Some("manual") => EnrollSource::Manual,
            _ => EnrollSource::Script,
        };
        let server_name = request
            .server_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| bare_host(&host_url));

        let fingerprint = if self.probe_fingerprints {
            match probe_fingerprint(&host_url, kind, Duration::from_secs(5)).await {
                Ok(fp) => Some(fp),
                Err(e) => {
                    warn!(host = %host_url, error = %e, "Fingerprint probe failed");
                    None
                }
            }
        } else {
            None
        };

        let placement = self
            .decide_placement(kind, &host_url, &server_name, &token_id, &token_value, source)
            .await;

        let outcome = self
            .apply(
                kind,
                placement,
                &host_url,
                &server_name,
                &token_id,
                &token_value,
                source,
                fingerprint,
            )
            .await?;

        let actor = match credential {
            EnrollCredential::SetupCode { org_id } => org_id
                .clone()
                .map_or_else(|| "setup-code".to_string(), |org| format!("setup-code/{org}")),
            EnrollCredential::ApiToken { name } => format!("api-token/{name}"),
        };
        AuditEvent::new("enroll.registered", true)
            .actor(actor)
            .client_ip(client_ip)
            .detail(format!(
                "{} {} {} ({})",
                outcome.action, kind, outcome.name, host_url
            ))
            .emit();

        // Durable state is already correct; fan-out failures only lose the
        // live notification, so they are not surfaced to the node.
        let _ = self.events.send(ControlEvent::NodeAutoRegistered {
            kind,
            name: outcome.name.clone(),
            host_url: host_url.clone(),
        });
        let _ = self.events.send(ControlEvent::DiscoveryUpdated);

        info!(kind = %kind, name = %outcome.name, action = outcome.action, "Node auto-registered");
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide_placement(
        &self,
        kind: NodeKind,
        host_url: &str,
        server_name: &str,
        token_id: &str,
        token_value: &str,
        source: EnrollSource,
    ) -> Placement {
        let instances = self
            .store
            .read(|config| config.instances(kind).clone())
            .await;

        // 1. Exact host URL
        if let Some(index) = instances.iter().position(|i| i.host_url == host_url) {
            return Placement::UpdateExact(index);
        }

        // 2. Same name + token id: the node kept its identity, its address
        // changed (DHCP)
        if let Some(index) = instances
            .iter()
            .position(|i| i.name == server_name && i.token_id == token_id)
        {
            return Placement::DhcpMove(index);
        }

        // 3. Agent-sourced IP report matching an existing hostname
        if source == EnrollSource::Agent {
            if let Ok(new_ip) = bare_host(host_url).parse::<IpAddr>() {
                for (index, instance) in instances.iter().enumerate() {
                    let existing_host = bare_host(&instance.host_url);
                    if existing_host.parse::<IpAddr>().is_ok() {
                        continue;
                    }
                    if self.resolver.resolve(&existing_host).await.contains(&new_ip) {
                        return Placement::AgentHostMatch(index);
                    }
                }
            }
        }

        // 4. Cluster membership check before inserting something new,
        // probing with the credentials the node itself just posted
        let cluster = if kind == NodeKind::Pve {
            self.prober
                .probe(host_url, token_id, token_value, false)
                .await
        } else {
            None
        };

        if let Some(ref info) = cluster {
            if let Some(index) = instances.iter().position(|i| {
                i.is_cluster && i.cluster_name.as_deref() == Some(info.name.as_str())
            }) {
                return Placement::MergeCluster {
                    index,
                    cluster: info.name.clone(),
                };
            }
        }

        Placement::Insert { cluster }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        kind: NodeKind,
        placement: Placement,
        host_url: &str,
        server_name: &str,
        token_id: &str,
        token_value: &str,
        source: EnrollSource,
        fingerprint: Option<String>,
    ) -> Result<EnrollmentOutcome> {
        let host_url = host_url.to_string();
        let server_name = server_name.to_string();
        let token_id = token_id.to_string();
        let token_value = token_value.to_string();

        self.store
            .update(move |config| {
                let instances = config.instances_mut(kind);
                match placement {
                    Placement::UpdateExact(index) => {
                        let Some(instance) = instances.get_mut(index) else {
                            return Err(Error::Internal("instance vanished".to_string()));
                        };
                        instance.token_id = token_id;
                        instance.token_value = token_value;
                        if fingerprint.is_some() {
                            instance.fingerprint = fingerprint;
                        }
                        instance.source = source;
                        instance.auto_registered = true;
                        Ok(EnrollmentOutcome {
                            success: true,
                            action: "updated",
                            name: instance.name.clone(),
                            merged: false,
                            cluster: None,
                            total_endpoints: None,
                        })
                    }
                    Placement::DhcpMove(index) => {
                        let Some(instance) = instances.get_mut(index) else {
                            return Err(Error::Internal("instance vanished".to_string()));
                        };
                        instance.host_url = host_url;
                        instance.token_id = token_id;
                        instance.token_value = token_value;
                        if fingerprint.is_some() {
                            instance.fingerprint = fingerprint;
                        }
                        instance.auto_registered = true;
                        Ok(EnrollmentOutcome {
                            success: true,
                            action: "updated",
                            name: instance.name.clone(),
                            merged: false,
                            cluster: None,
                            total_endpoints: None,
                        })
                    }
                    Placement::AgentHostMatch(index) => {
                        let Some(instance) = instances.get_mut(index) else {
                            return Err(Error::Internal("instance vanished".to_string()));
                        };
                        // The admin configured a hostname; the agent only
                        // knows its IP. Keep the hostname.
                        instance.token_id = token_id;
                        instance.token_value = token_value;
                        if fingerprint.is_some() {
                            instance.fingerprint = fingerprint;
                        }
                        instance.source = source;
                        instance.auto_registered = true;
                        Ok(EnrollmentOutcome {
                            success: true,
                            action: "updated",
                            name: instance.name.clone(),
                            merged: false,
                            cluster: None,
                            total_endpoints: None,
                        })
                    }
                    Placement::MergeCluster { index, cluster } => {
                        let Some(instance) = instances.get_mut(index) else {
                            return Err(Error::Internal("instance vanished".to_string()));
                        };
                        if !instance
                            .cluster_endpoints
                            .iter()
                            .any(|e| e.host_url == host_url)
                        {
                            instance.cluster_endpoints.push(ClusterEndpoint {
                                node_name: server_name,
                                host_url,
                            });
                        }
                        Ok(EnrollmentOutcome {
                            success: true,
                            action: "merged",
                            name: instance.name.clone(),
                            merged: true,
                            cluster: Some(cluster),
                            total_endpoints: Some(instance.cluster_endpoints.len()),
                        })
                    }
                    Placement::Insert { cluster } => {
                        let (name, is_cluster, cluster_name, endpoints) = match cluster {
                            Some(info) => {
                                let endpoints = vec![ClusterEndpoint {
                                    node_name: server_name.clone(),
                                    host_url: host_url.clone(),
                                }];
                                (info.name.clone(), true, Some(info.name), endpoints)
                            }
                            None => (server_name.clone(), false, None, Vec::new()),
                        };

                        instances.push(NodeInstance {
                            name: name.clone(),
                            host_url,
                            token_id,
                            token_value,
                            verify_tls: false,
                            monitor: MonitorFlags::default(),
                            is_cluster,
                            cluster_name,
                            cluster_endpoints: endpoints,
                            fingerprint,
                            source,
                            auto_registered: true,
                        });
                        Ok(EnrollmentOutcome {
                            success: true,
                            action: "created",
                            name,
                            merged: false,
                            cluster: None,
                            total_endpoints: None,
                        })
                    }
                }
            })
            .await
    }
}
