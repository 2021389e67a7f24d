use std::{ffi::OsString, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use snafu::ResultExt as _;
use tokio::process::Command;
use tracing::debug;

use super::{CertificateAuthority, CertificateBundle, Subject, SubjectAltNames};
use crate::error::{BootstrapError, LaunchCertificateTool, WriteArtifact};

const KEY_BITS: &str = "2048";
const CA_VALIDITY_DAYS: &str = "1024";
const LEAF_VALIDITY_DAYS: &str = "1001";

/// A certificate authority backed by the `openssl` command-line toolchain.
///
/// Every step runs as a separate `openssl` invocation. A non-zero exit at any step aborts issuance.
pub struct OpensslAuthority {
    openssl: PathBuf,
    bundle: CertificateBundle,
}

impl OpensslAuthority {
    /// Creates a new `OpensslAuthority` writing to `bundle`, invoking the toolchain at `openssl`.
    ///
    /// `openssl` may be a bare program name, in which case it is resolved through `PATH`.
    pub fn new<P: Into<PathBuf>>(openssl: P, bundle: CertificateBundle) -> Self {
        Self {
            openssl: openssl.into(),
            bundle,
        }
    }

    /// Path of the extension file handed to the signing step.
    fn extension_file(&self) -> PathBuf {
        self.bundle.dir().join("service.ext")
    }

    async fn run(&self, step: &'static str, args: Vec<OsString>) -> Result<(), BootstrapError> {
        debug!(step, program = %self.openssl.display(), ?args, "Running certificate toolchain step.");

        let output = Command::new(&self.openssl)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context(LaunchCertificateTool { step })?;

        if !output.status.success() {
            return Err(BootstrapError::CertificateToolFailed {
                step,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for OpensslAuthority {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    async fn create_ca(&self) -> Result<(), BootstrapError> {
        let b = &self.bundle;

        self.run("ca-key", args(["genrsa", "-out"]).path(b.ca_key()).arg(KEY_BITS).build())
            .await?;

        self.run(
            "ca-cert",
            args(["req", "-x509", "-new", "-nodes", "-sha256", "-days", CA_VALIDITY_DAYS])
                .arg("-subj")
                .arg(Subject::AUTHORITY.to_openssl_subject())
                .arg("-key")
                .path(b.ca_key())
                .arg("-out")
                .path(b.ca_cert())
                .build(),
        )
        .await
    }

    async fn issue_leaf(&self, sans: &SubjectAltNames) -> Result<(), BootstrapError> {
        let b = &self.bundle;

        self.run("service-key", args(["genrsa", "-out"]).path(b.service_key()).arg(KEY_BITS).build())
            .await?;

        self.run(
            "service-csr",
            args(["req", "-new", "-sha256"])
                .arg("-subj")
                .arg(Subject::SERVICE.to_openssl_subject())
                .arg("-addext")
                .arg(format!("subjectAltName={}", sans.to_extension_value()))
                .arg("-key")
                .path(b.service_key())
                .arg("-out")
                .path(b.service_csr())
                .build(),
        )
        .await?;

        // Extensions requested in the CSR are not carried over by `x509 -req` on every toolchain version, so they are
        // restated explicitly for the signing step.
        let extension_file = self.extension_file();
        let extensions = format!(
            "basicConstraints=CA:FALSE\nkeyUsage=digitalSignature,keyEncipherment\nextendedKeyUsage=serverAuth,clientAuth\nsubjectAltName={}\n",
            sans.to_extension_value()
        );
        tokio::fs::write(&extension_file, extensions)
            .await
            .context(WriteArtifact { path: &extension_file })?;

        self.run(
            "service-cert",
            args(["x509", "-req", "-sha256", "-CAcreateserial", "-days", LEAF_VALIDITY_DAYS])
                .arg("-in")
                .path(b.service_csr())
                .arg("-CA")
                .path(b.ca_cert())
                .arg("-CAkey")
                .path(b.ca_key())
                .arg("-extfile")
                .path(extension_file)
                .arg("-out")
                .path(b.service_cert())
                .build(),
        )
        .await?;

        self.run(
            "parse-leaf",
            args(["x509", "-noout", "-text", "-in"]).path(b.service_cert()).build(),
        )
        .await?;

        self.run(
            "verify-leaf",
            args(["verify", "-CAfile"])
                .path(b.ca_cert())
                .path(b.service_cert())
                .build(),
        )
        .await
    }
}

/// Small builder for toolchain argument vectors.
struct Args(Vec<OsString>);

fn args<const N: usize>(initial: [&str; N]) -> Args {
    Args(initial.iter().map(OsString::from).collect())
}

impl Args {
    fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.0.push(arg.into());
        self
    }

    fn path(mut self, path: PathBuf) -> Self {
        self.0.push(path.into_os_string());
        self
    }

    fn build(self) -> Vec<OsString> {
        self.0
    }
}
