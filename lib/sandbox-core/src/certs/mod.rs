//! Certificate chain issuance.
//!
//! The sandbox uses a single trust chain: a locally generated certificate authority, and one leaf certificate signed by
//! it that every service (and the discovery agent's checks) presents for mutual TLS. Issuance is all-or-nothing, and
//! re-running it over a populated directory replaces the whole chain.

use std::{
    fmt,
    io::BufReader,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use rustls::{
    client::{danger::ServerCertVerifier as _, WebPkiServerVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    RootCertStore,
};
use sandbox_error::{generic_error, ErrorContext as _, GenericError};
use snafu::ResultExt as _;
use tracing::{debug, info};

use crate::error::{BootstrapError, CertificateIssuance, ReadArtifact};

mod native;
pub use self::native::NativeAuthority;

mod openssl;
pub use self::openssl::OpensslAuthority;

/// Placeholder hostname included in the leaf certificate.
pub const PLACEHOLDER_HOSTNAME: &str = "gunkan.local";

/// Distinguished name attributes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subject {
    /// Country (`C`).
    pub country: &'static str,

    /// Organization (`O`).
    pub organization: &'static str,

    /// Common name (`CN`).
    pub common_name: &'static str,
}

impl Subject {
    /// Subject of the certificate authority.
    pub const AUTHORITY: Subject = Subject {
        country: "FR",
        organization: "Gunkan",
        common_name: "Gunkan Sandbox CA",
    };

    /// Subject of the shared service certificate.
    pub const SERVICE: Subject = Subject {
        country: "FR",
        organization: "Gunkan",
        common_name: "gunkan-service",
    };

    /// Returns the subject in the slash-separated form understood by `openssl -subj`.
    pub fn to_openssl_subject(&self) -> String {
        format!("/C={}/O={}/CN={}", self.country, self.organization, self.common_name)
    }
}

/// Subject alternative names carried by the leaf certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubjectAltNames {
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl SubjectAltNames {
    /// Builds the name set for services listening on `address`.
    ///
    /// Always covers `localhost`, the placeholder hostname and the IPv4 loopback address, plus `address` itself when it
    /// differs from loopback.
    pub fn for_address(address: IpAddr) -> Self {
        let mut ip_addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        if !ip_addresses.contains(&address) {
            ip_addresses.push(address);
        }

        Self {
            dns_names: vec!["localhost".to_string(), PLACEHOLDER_HOSTNAME.to_string()],
            ip_addresses,
        }
    }

    /// Returns the DNS names.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Returns the IP addresses.
    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    /// Returns the names in the form used by the `subjectAltName` X.509v3 extension configuration.
    pub fn to_extension_value(&self) -> String {
        self.dns_names
            .iter()
            .map(|name| format!("DNS:{}", name))
            .chain(self.ip_addresses.iter().map(|ip| format!("IP:{}", ip)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for SubjectAltNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_extension_value())
    }
}

/// Location of the certificate chain files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateBundle {
    dir: PathBuf,
}

impl CertificateBundle {
    /// Creates a bundle stored in `dir`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory holding the bundle.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Private key of the certificate authority.
    pub fn ca_key(&self) -> PathBuf {
        self.dir.join("ca.key")
    }

    /// Self-signed certificate of the certificate authority.
    pub fn ca_cert(&self) -> PathBuf {
        self.dir.join("ca.pem")
    }

    /// Private key of the services.
    pub fn service_key(&self) -> PathBuf {
        self.dir.join("service.key")
    }

    /// Certificate signing request of the services.
    pub fn service_csr(&self) -> PathBuf {
        self.dir.join("service.csr")
    }

    /// Leaf certificate of the services, signed by the certificate authority.
    pub fn service_cert(&self) -> PathBuf {
        self.dir.join("service.pem")
    }

    /// Returns every artifact of the bundle.
    pub fn artifacts(&self) -> [PathBuf; 5] {
        [
            self.ca_key(),
            self.ca_cert(),
            self.service_key(),
            self.service_csr(),
            self.service_cert(),
        ]
    }
}

/// A certificate authority able to issue the sandbox trust chain.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Returns a short name for this implementation.
    fn name(&self) -> &'static str;

    /// Returns the bundle this authority writes to.
    fn bundle(&self) -> &CertificateBundle;

    /// Creates the authority's private key and self-signed certificate.
    ///
    /// # Errors
    ///
    /// If the key or certificate cannot be generated or written, an error is returned.
    async fn create_ca(&self) -> Result<(), BootstrapError>;

    /// Creates the service key and signing request, and signs it with the authority created by
    /// [`create_ca`][Self::create_ca].
    ///
    /// # Errors
    ///
    /// If the authority does not exist yet, or if any step of issuance fails, an error is returned.
    async fn issue_leaf(&self, sans: &SubjectAltNames) -> Result<(), BootstrapError>;
}

/// Issues the full chain with `authority`, then verifies the leaf against the authority.
///
/// # Errors
///
/// If any step fails, an error is returned. The bundle may be left partially written.
pub async fn generate_chain(
    authority: &dyn CertificateAuthority, sans: &SubjectAltNames,
) -> Result<(), BootstrapError> {
    let bundle = authority.bundle();
    info!(authority = authority.name(), dir = %bundle.dir().display(), sans = %sans, "Issuing certificate chain...");

    authority.create_ca().await?;
    debug!("Certificate authority created.");

    authority.issue_leaf(sans).await?;
    debug!("Leaf certificate issued.");

    verify_leaf(bundle, sans).await?;
    info!("Certificate chain issued and verified.");

    Ok(())
}

/// Verifies that the leaf certificate parses, chains to the authority, and is valid for every name in `sans`.
///
/// # Errors
///
/// If either certificate cannot be read or parsed, or if verification fails for any name, an error is returned.
pub async fn verify_leaf(bundle: &CertificateBundle, sans: &SubjectAltNames) -> Result<(), BootstrapError> {
    let ca_cert = read_single_certificate(&bundle.ca_cert()).await?;
    let leaf_cert = read_single_certificate(&bundle.service_cert()).await?;

    check_leaf(ca_cert, &leaf_cert, sans).context(CertificateIssuance { step: "verify-leaf" })
}

async fn read_single_certificate(path: &Path) -> Result<CertificateDer<'static>, BootstrapError> {
    let raw = tokio::fs::read(path).await.context(ReadArtifact { path })?;

    let mut reader = BufReader::new(raw.as_slice());
    let mut certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_error_context(|| format!("Failed to parse PEM certificate '{}'.", path.display()))
        .context(CertificateIssuance { step: "parse-certificate" })?;

    if certs.is_empty() {
        return Err(generic_error!("No certificate found in '{}'.", path.display()))
            .context(CertificateIssuance { step: "parse-certificate" });
    }

    Ok(certs.swap_remove(0))
}

fn check_leaf(
    ca_cert: CertificateDer<'static>, leaf_cert: &CertificateDer<'_>, sans: &SubjectAltNames,
) -> Result<(), GenericError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(ca_cert)
        .error_context("Certificate authority is not a valid trust anchor.")?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .error_context("Failed to build certificate verifier.")?;

    let names = sans
        .dns_names()
        .iter()
        .map(|name| ServerName::try_from(name.clone()).map_err(|e| generic_error!("invalid DNS name '{}': {}", name, e)))
        .chain(sans.ip_addresses().iter().map(|ip| Ok(ServerName::from(*ip))))
        .collect::<Result<Vec<_>, _>>()?;

    let now = UnixTime::now();
    for name in names {
        verifier
            .verify_server_cert(leaf_cert, &[], &name, &[], now)
            .with_error_context(|| format!("Leaf certificate is not valid for {:?}.", name))?;
    }

    Ok(())
}
