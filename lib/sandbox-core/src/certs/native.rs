use std::path::Path;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use sandbox_error::{ErrorContext as _, GenericError};
use snafu::ResultExt as _;
use tracing::debug;

use super::{CertificateAuthority, CertificateBundle, Subject, SubjectAltNames};
use crate::error::{BootstrapError, CertificateIssuance, ReadArtifact, WriteArtifact};

/// A certificate authority implemented in-process.
///
/// Produces the same set of artifacts as [`OpensslAuthority`][super::OpensslAuthority], using ECDSA P-256 keys.
pub struct NativeAuthority {
    bundle: CertificateBundle,
}

impl NativeAuthority {
    /// Creates a new `NativeAuthority` writing to `bundle`.
    pub fn new(bundle: CertificateBundle) -> Self {
        Self { bundle }
    }
}

#[async_trait]
impl CertificateAuthority for NativeAuthority {
    fn name(&self) -> &'static str {
        "native"
    }

    fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    async fn create_ca(&self) -> Result<(), BootstrapError> {
        let (key_pem, cert_pem) = self_signed_authority().context(CertificateIssuance { step: "create-ca" })?;

        write_artifact(&self.bundle.ca_key(), key_pem).await?;
        write_artifact(&self.bundle.ca_cert(), cert_pem).await
    }

    async fn issue_leaf(&self, sans: &SubjectAltNames) -> Result<(), BootstrapError> {
        let ca_key_path = self.bundle.ca_key();
        let ca_key_pem = tokio::fs::read_to_string(&ca_key_path)
            .await
            .context(ReadArtifact { path: &ca_key_path })?;

        let leaf = signed_leaf(&ca_key_pem, sans).context(CertificateIssuance { step: "issue-leaf" })?;

        write_artifact(&self.bundle.service_key(), leaf.key_pem).await?;
        write_artifact(&self.bundle.service_csr(), leaf.csr_pem).await?;
        write_artifact(&self.bundle.service_cert(), leaf.cert_pem).await
    }
}

struct SignedLeaf {
    key_pem: String,
    csr_pem: String,
    cert_pem: String,
}

fn distinguished_name(subject: &Subject) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CountryName, subject.country);
    name.push(DnType::OrganizationName, subject.organization);
    name.push(DnType::CommonName, subject.common_name);
    name
}

fn authority_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&Subject::AUTHORITY);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn leaf_params(sans: &SubjectAltNames) -> Result<CertificateParams, GenericError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&Subject::SERVICE);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    params.use_authority_key_identifier_extension = true;

    for name in sans.dns_names() {
        let name = Ia5String::try_from(name.as_str()).with_error_context(|| format!("Invalid DNS name '{}'.", name))?;
        params.subject_alt_names.push(SanType::DnsName(name));
    }
    for ip in sans.ip_addresses() {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    Ok(params)
}

fn self_signed_authority() -> Result<(String, String), GenericError> {
    let key = KeyPair::generate().error_context("Failed to generate authority key.")?;
    let cert = authority_params()
        .self_signed(&key)
        .error_context("Failed to self-sign authority certificate.")?;

    Ok((key.serialize_pem(), cert.pem()))
}

fn signed_leaf(ca_key_pem: &str, sans: &SubjectAltNames) -> Result<SignedLeaf, GenericError> {
    // The issuer only contributes its name and key identifier to the leaf, both of which are derived from the fixed
    // authority parameters and the persisted key, so rebuilding it here yields the same issuer as `ca.pem`.
    let ca_key = KeyPair::from_pem(ca_key_pem).error_context("Failed to load authority key.")?;
    let issuer = authority_params()
        .self_signed(&ca_key)
        .error_context("Failed to rebuild authority certificate.")?;

    let key = KeyPair::generate().error_context("Failed to generate service key.")?;
    let params = leaf_params(sans)?;
    let csr_pem = params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .error_context("Failed to build service signing request.")?;
    let cert = params
        .signed_by(&key, &issuer, &ca_key)
        .error_context("Failed to sign service certificate.")?;

    debug!(sans = %sans, "Signed service certificate.");

    Ok(SignedLeaf {
        key_pem: key.serialize_pem(),
        csr_pem,
        cert_pem: cert.pem(),
    })
}

async fn write_artifact(path: &Path, contents: String) -> Result<(), BootstrapError> {
    tokio::fs::write(path, contents).await.context(WriteArtifact { path })
}
