//! Discovery agent configuration rendering.
//!
//! The discovery agent is configured with one root document, and one service definition per service placed in the
//! agent's configuration directory. Each service definition carries the health check matching the service's protocol.

use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tracing::{debug, info};

use crate::{
    certs::CertificateBundle,
    error::{BootstrapError, Render, WriteArtifact},
    topology::{Layout, ProtocolKind, ServiceDescriptor, Topology},
};

/// Settings of the discovery agent process.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Executable of the agent.
    pub executable: PathBuf,

    /// Node name the agent registers itself under.
    pub node_name: String,

    /// Datacenter name.
    pub datacenter: String,

    /// Agent log level.
    pub log_level: String,

    /// Whether the agent serves its web UI.
    pub ui: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("consul"),
            node_name: "test-node".to_string(),
            datacenter: "test-dc".to_string(),
            log_level: "INFO".to_string(),
            ui: true,
        }
    }
}

/// Timing of the health checks run by the agent.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CheckSettings {
    /// Interval between two checks, in the agent's duration syntax.
    pub interval: String,

    /// Timeout of a single check, in the agent's duration syntax.
    pub timeout: String,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            interval: "2s".to_string(),
            timeout: "1s".to_string(),
        }
    }
}

/// Root configuration document of the agent.
#[derive(Debug, Serialize)]
pub struct AgentConfig {
    node_name: String,
    datacenter: String,
    data_dir: PathBuf,
    log_level: String,
    server: bool,
    enable_syslog: bool,
    syslog_facility: &'static str,
    ui: bool,
    serf_lan: IpAddr,
    serf_wan: IpAddr,
    bind_addr: IpAddr,
    client_addr: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cert_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_agent_tls_for_checks: Option<bool>,
}

impl AgentConfig {
    /// Builds the root configuration for an agent bound to `address`.
    ///
    /// When `bundle` is set, the agent is pointed at the certificate chain so that it can run TLS health checks.
    pub fn new(settings: &AgentSettings, layout: &Layout, address: IpAddr, bundle: Option<&CertificateBundle>) -> Self {
        Self {
            node_name: settings.node_name.clone(),
            datacenter: settings.datacenter.clone(),
            data_dir: layout.agent_data_dir(),
            log_level: settings.log_level.clone(),
            server: true,
            enable_syslog: true,
            syslog_facility: "LOCAL0",
            ui: settings.ui,
            serf_lan: address,
            serf_wan: address,
            bind_addr: address,
            client_addr: address,
            ca_file: bundle.map(CertificateBundle::ca_cert),
            cert_file: bundle.map(CertificateBundle::service_cert),
            key_file: bundle.map(CertificateBundle::service_key),
            // HTTPS and gRPC checks only present the agent's certificate when this is set.
            enable_agent_tls_for_checks: bundle.map(|_| true),
        }
    }
}

/// Service definition document, as read from the agent's configuration directory.
#[derive(Debug, Serialize)]
pub struct ServiceDefinition {
    service: ServiceEntry,
}

#[derive(Debug, Serialize)]
struct ServiceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<HttpCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    checks: Vec<NetworkCheck>,
    id: String,
    name: String,
    tags: Vec<String>,
    address: IpAddr,
    port: u16,
}

#[derive(Debug, Serialize)]
struct HttpCheck {
    id: String,
    interval: String,
    timeout: String,
    http: String,
}

#[derive(Debug, Serialize)]
struct NetworkCheck {
    id: String,
    interval: String,
    timeout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grpc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grpc_use_tls: Option<bool>,
}

impl NetworkCheck {
    fn tcp(id: String, checks: &CheckSettings, endpoint: String) -> Self {
        Self {
            id,
            interval: checks.interval.clone(),
            timeout: checks.timeout.clone(),
            tcp: Some(endpoint),
            grpc: None,
            grpc_use_tls: None,
        }
    }

    fn grpc(id: String, checks: &CheckSettings, endpoint: String) -> Self {
        Self {
            id,
            interval: checks.interval.clone(),
            timeout: checks.timeout.clone(),
            tcp: None,
            grpc: Some(endpoint),
            grpc_use_tls: Some(true),
        }
    }
}

impl ServiceDefinition {
    /// Builds the definition of `service`, with the health check matching its protocol.
    ///
    /// gRPC services are only checked at the gRPC level when TLS is enabled. Otherwise they fall back to a TCP check.
    pub fn new(service: &ServiceDescriptor, checks: &CheckSettings, tls: bool) -> Self {
        let check_id = format!("check-{}", service.id);
        let endpoint = service.endpoint().to_string();

        let (check, network_checks) = match service.kind {
            ProtocolKind::Http => {
                let scheme = if tls { "https" } else { "http" };
                let check = HttpCheck {
                    id: check_id,
                    interval: checks.interval.clone(),
                    timeout: checks.timeout.clone(),
                    http: format!("{}://{}/health", scheme, endpoint),
                };
                (Some(check), Vec::new())
            }
            ProtocolKind::Grpc if tls => (None, vec![NetworkCheck::grpc(check_id, checks, endpoint)]),
            ProtocolKind::Grpc | ProtocolKind::Tcp => (None, vec![NetworkCheck::tcp(check_id, checks, endpoint)]),
        };

        Self {
            service: ServiceEntry {
                check,
                checks: network_checks,
                id: service.id.clone(),
                name: service.service_name.clone(),
                tags: vec![service.tag.clone()],
                address: service.address,
                port: service.port,
            },
        }
    }
}

/// Everything needed to render the agent configuration.
#[derive(Clone, Debug)]
pub struct RegistryContext<'a> {
    /// Agent process settings.
    pub agent: &'a AgentSettings,

    /// Health check timing.
    pub checks: &'a CheckSettings,

    /// Address the agent binds to.
    pub address: IpAddr,

    /// Certificate chain, when TLS is enabled.
    pub bundle: Option<&'a CertificateBundle>,
}

/// Outcome of a rendering pass.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct RenderReport {
    /// Path of the root configuration.
    pub agent_config: PathBuf,

    /// Paths of the service definitions, in topology order.
    pub service_definitions: Vec<PathBuf>,
}

/// Writes the agent root configuration and one service definition per service.
///
/// Existing documents are overwritten.
///
/// # Errors
///
/// If a document cannot be serialized or written, an error is returned.
pub async fn write_registry(
    topology: &Topology, layout: &Layout, context: &RegistryContext<'_>,
) -> Result<RenderReport, BootstrapError> {
    let tls = context.bundle.is_some();

    let agent_config = layout.agent_config_file();
    let root = AgentConfig::new(context.agent, layout, context.address, context.bundle);
    write_document(&agent_config, &root).await?;

    let mut service_definitions = Vec::with_capacity(topology.len());
    for service in topology.services() {
        let path = layout.check_file_for(&service.id);
        write_document(&path, &ServiceDefinition::new(service, context.checks, tls)).await?;
        debug!(service_id = %service.id, kind = %service.kind, path = %path.display(), "Rendered service definition.");
        service_definitions.push(path);
    }

    info!(
        services = service_definitions.len(),
        tls,
        agent_config = %agent_config.display(),
        "Rendered discovery agent configuration."
    );

    Ok(RenderReport {
        agent_config,
        service_definitions,
    })
}

async fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), BootstrapError> {
    let mut rendered = serde_json::to_vec_pretty(document).context(Render { path })?;
    rendered.push(b'\n');

    tokio::fs::write(path, rendered).await.context(WriteArtifact { path })
}
