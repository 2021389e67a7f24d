use std::fmt::Write as _;

use sandbox_app::prelude::{update_pid_file, TerminationRequest};
use sandbox_core::{
    certs::{generate_chain, CertificateAuthority, CertificateBundle, NativeAuthority, OpensslAuthority, SubjectAltNames},
    provision::provision,
    registry::{write_registry, RegistryContext},
    supervisor::{supervise, ProcessSpec, ShutdownReport, SupervisorSettings},
    topology::{Layout, Topology, TopologyGenerator},
};
use sandbox_error::{ErrorContext as _, GenericError};
use tracing::{debug, info};

use crate::config::{AuthorityKind, SandboxConfig};

/// Sandbox driver.
///
/// Holds the materialized topology, so that planning, provisioning, rendering and spawning all see the same services.
pub struct Driver {
    config: SandboxConfig,
    layout: Layout,
    topology: Topology,
}

impl Driver {
    /// Creates a new `Driver` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the service rule table is invalid, an error is returned.
    pub fn from_config(config: SandboxConfig) -> Result<Self, GenericError> {
        let layout = Layout::new(config.base_dir.clone());
        let generator = TopologyGenerator::new(config.services.clone(), config.address, config.base_port, layout.clone())?;
        let topology = Topology::materialize(&generator);

        Ok(Self {
            config,
            layout,
            topology,
        })
    }

    /// Returns the materialized topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Describes every process that would be spawned, one line each, in spawn order.
    pub fn plan(&self) -> Vec<String> {
        self.process_specs()
            .into_iter()
            .map(|spec| {
                let mut line = format!("{:<16} {}", spec.id, spec.program.display());
                for arg in &spec.args {
                    let _ = write!(line, " {}", arg.to_string_lossy());
                }
                line
            })
            .collect()
    }

    /// Describes every process to spawn: services in topology order, then the discovery agent.
    pub fn process_specs(&self) -> Vec<ProcessSpec> {
        self.topology
            .services()
            .iter()
            .map(|service| ProcessSpec::for_service(service, self.config.tls))
            .chain(std::iter::once(ProcessSpec::for_agent(&self.config.agent, &self.layout)))
            .collect()
    }

    fn certificate_authority(&self) -> Box<dyn CertificateAuthority> {
        let bundle = CertificateBundle::new(self.layout.config_dir());
        match self.config.cert_authority {
            AuthorityKind::Openssl => Box::new(OpensslAuthority::new(self.config.openssl_path.clone(), bundle)),
            AuthorityKind::Native => Box::new(NativeAuthority::new(bundle)),
        }
    }

    /// Provisions directories, issues the certificate chain, and renders the discovery agent configuration.
    ///
    /// # Errors
    ///
    /// If any of those steps fails, an error is returned.
    pub async fn prepare(&self) -> Result<(), GenericError> {
        info!(
            services = self.topology.len(),
            base_dir = %self.layout.base_dir().display(),
            tls = self.config.tls,
            "Preparing sandbox..."
        );

        provision(&self.topology, &self.layout).await?;

        let authority = self.certificate_authority();
        let sans = SubjectAltNames::for_address(self.config.address);
        generate_chain(authority.as_ref(), &sans).await?;

        let context = RegistryContext {
            agent: &self.config.agent,
            checks: &self.config.check,
            address: self.config.address,
            bundle: self.config.tls.then(|| authority.bundle()),
        };
        write_registry(&self.topology, &self.layout, &context).await?;

        Ok(())
    }

    /// Prepares the sandbox, then spawns and supervises every process until `termination` resolves.
    ///
    /// # Errors
    ///
    /// If preparation fails, if a process fails to spawn, or if a process cannot be reaped, an error is returned.
    pub async fn run(&self, termination: &mut TerminationRequest) -> Result<ShutdownReport, GenericError> {
        self.prepare().await?;

        let pid_file = self.layout.pid_file();
        update_pid_file(&pid_file)
            .with_error_context(|| format!("Failed to write PID file '{}'.", pid_file.display()))?;

        let settings = SupervisorSettings {
            grace_period: self.config.shutdown_grace_period.0,
            ..SupervisorSettings::default()
        };
        let result = supervise(&self.process_specs(), settings, termination).await;

        if let Err(e) = std::fs::remove_file(&pid_file) {
            debug!(path = %pid_file.display(), error = %e, "Failed to remove PID file.");
        }

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use sandbox_core::topology::{ProtocolKind, ServiceRule};
    use serde_json::Value;

    use super::*;

    fn small_config(base_dir: PathBuf) -> SandboxConfig {
        SandboxConfig {
            base_dir,
            cert_authority: AuthorityKind::Native,
            services: vec![
                ServiceRule::stateful("index-store", 2, "/bin/sleep", ProtocolKind::Grpc),
                ServiceRule::stateless("data-gate", 1, "/bin/sleep", ProtocolKind::Http),
            ],
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn plan_lists_agent_last() {
        let driver = Driver::from_config(small_config(PathBuf::from("/tmp/gunkan"))).unwrap();

        let plan = driver.plan();
        assert_eq!(plan.len(), 4);
        assert_eq!(
            plan[0],
            "index-store-0    /bin/sleep 127.0.0.1:6000 --tls /tmp/gunkan/etc /tmp/gunkan/data/index-store-0"
        );
        assert_eq!(plan[2], "data-gate-2      /bin/sleep 127.0.0.1:6002 --tls /tmp/gunkan/etc");
        assert!(plan[3].starts_with("consul-0         consul agent -server"));
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let config = SandboxConfig {
            base_port: 65535,
            ..small_config(PathBuf::from("/tmp/gunkan"))
        };

        assert!(Driver::from_config(config).is_err());
    }

    #[tokio::test]
    async fn prepare_renders_everything() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::from_config(small_config(dir.path().to_path_buf())).unwrap();

        driver.prepare().await.unwrap();

        let layout = Layout::new(dir.path());
        for artifact in CertificateBundle::new(layout.config_dir()).artifacts() {
            assert!(artifact.is_file(), "missing {}", artifact.display());
        }
        assert!(layout.volume_for("index-store-1").is_dir());

        let root: Value = serde_json::from_slice(&std::fs::read(layout.agent_config_file()).unwrap()).unwrap();
        assert_eq!(root["cert_file"], Value::from(layout.config_dir().join("service.pem").display().to_string()));

        let gate: Value = serde_json::from_slice(&std::fs::read(layout.check_file_for("data-gate-2")).unwrap()).unwrap();
        assert_eq!(gate["service"]["check"]["http"], "https://127.0.0.1:6002/health");

        // Preparing again over the same tree is harmless.
        driver.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn run_reaps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path().to_path_buf());
        config.tls = false;
        config.agent.executable = PathBuf::from("/bin/sleep");
        config.shutdown_grace_period.0 = Duration::from_secs(2);
        let driver = Driver::from_config(config).unwrap();

        let mut termination = TerminationRequest::wrapped(tokio::time::sleep(Duration::from_millis(300)));
        let report = driver.run(&mut termination).await.unwrap();

        assert_eq!(
            report.statuses.keys().map(String::as_str).collect::<Vec<_>>(),
            ["index-store-0", "index-store-1", "data-gate-2", "consul-0"]
        );
        assert!(!Layout::new(dir.path()).pid_file().exists());
    }

    #[tokio::test]
    async fn pid_file_is_removed_after_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path().to_path_buf());
        config.tls = false;
        config.services[1].executable = dir.path().join("missing-binary");
        config.shutdown_grace_period.0 = Duration::from_secs(2);
        let driver = Driver::from_config(config).unwrap();

        let mut termination = TerminationRequest::never();
        assert!(driver.run(&mut termination).await.is_err());

        let layout = Layout::new(dir.path());
        assert!(layout.agent_config_file().is_file());
        assert!(!layout.pid_file().exists());
    }
}
