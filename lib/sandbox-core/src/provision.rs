//! On-disk provisioning.

use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::ResultExt as _;
use tokio::fs;
use tracing::{debug, info};

use crate::{
    error::{BootstrapError, CreateDirectory},
    topology::{Layout, Topology},
};

/// Outcome of a provisioning pass.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ProvisioningReport {
    /// Directories that did not exist and were created.
    pub created: Vec<PathBuf>,

    /// Directories that already existed.
    pub existing: Vec<PathBuf>,
}

/// Creates every directory the sandbox needs.
///
/// This covers the storage volume of each stateful service, the shared configuration directory, and the discovery
/// agent's data and check directories. Directories that already exist are left untouched, so running this twice over
/// the same topology is harmless.
///
/// # Errors
///
/// If a directory cannot be created for any reason other than already existing, an error is returned and no further
/// directories are created.
pub async fn provision(topology: &Topology, layout: &Layout) -> Result<ProvisioningReport, BootstrapError> {
    let mut report = ProvisioningReport::default();

    let mut directories = Vec::with_capacity(topology.len() + 3);
    for service in topology.services() {
        if let Some(volume) = &service.volume {
            directories.push(volume.clone());
        }
        directories.push(service.config_dir.clone());
    }
    directories.push(layout.config_dir());
    directories.push(layout.agent_check_dir());
    directories.push(layout.agent_data_dir());

    for directory in directories {
        if report.created.contains(&directory) || report.existing.contains(&directory) {
            continue;
        }

        if ensure_directory(&directory).await? {
            debug!(path = %directory.display(), "Created directory.");
            report.created.push(directory);
        } else {
            report.existing.push(directory);
        }
    }

    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        base_dir = %layout.base_dir().display(),
        "Provisioned sandbox directories."
    );

    Ok(report)
}

/// Ensures `path` exists as a directory, returning `true` if it had to be created.
async fn ensure_directory(path: &Path) -> Result<bool, BootstrapError> {
    if is_directory(path).await {
        return Ok(false);
    }

    match fs::create_dir_all(path).await {
        Ok(()) => Ok(true),
        // Lost a race with another creator.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && is_directory(path).await => Ok(false),
        Err(e) => Err(e).context(CreateDirectory { path }),
    }
}

async fn is_directory(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::{
        topology::{ProtocolKind, ServiceRule, TopologyGenerator},
        FailureKind,
    };

    fn small_topology(layout: &Layout) -> Topology {
        let rules = vec![
            ServiceRule::stateful("index-store", 2, "store", ProtocolKind::Grpc),
            ServiceRule::stateless("index-gate", 1, "gate", ProtocolKind::Grpc),
        ];
        let generator =
            TopologyGenerator::new(rules, IpAddr::V4(Ipv4Addr::LOCALHOST), 6000, layout.clone()).unwrap();
        Topology::materialize(&generator)
    }

    #[tokio::test]
    async fn creates_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let topology = small_topology(&layout);

        let report = provision(&topology, &layout).await.unwrap();

        assert!(report.existing.is_empty());
        assert_eq!(report.created.len(), 5);
        for path in [
            layout.volume_for("index-store-0"),
            layout.volume_for("index-store-1"),
            layout.config_dir(),
            layout.agent_check_dir(),
            layout.agent_data_dir(),
        ] {
            assert!(path.is_dir(), "missing {}", path.display());
        }
        assert!(!layout.volume_for("index-gate-2").exists());
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let topology = small_topology(&layout);

        let first = provision(&topology, &layout).await.unwrap();
        std::fs::write(layout.volume_for("index-store-0").join("marker"), b"keep").unwrap();

        let second = provision(&topology, &layout).await.unwrap();

        assert!(second.created.is_empty());
        assert_eq!(second.existing, first.created);
        let marker = std::fs::read(layout.volume_for("index-store-0").join("marker")).unwrap();
        assert_eq!(marker, b"keep");
    }

    #[tokio::test]
    async fn file_in_the_way_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let topology = small_topology(&layout);

        std::fs::create_dir_all(layout.data_dir()).unwrap();
        std::fs::write(layout.volume_for("index-store-1"), b"not a directory").unwrap();

        let err = provision(&topology, &layout).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Provisioning);
        assert!(err.to_string().contains("index-store-1"));
    }
}
