use std::{io, path::PathBuf};

use sandbox_error::GenericError;
use snafu::Snafu;

/// Broad category of a bootstrap failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// Directory or artifact could not be created on disk.
    Provisioning,

    /// The certificate chain could not be issued or verified.
    Certificate,

    /// The sandbox configuration is invalid.
    Configuration,

    /// A service or the discovery agent could not be started.
    Spawn,

    /// A process could not be reaped during shutdown.
    Shutdown,
}

/// Bootstrap error.
///
/// Every variant is fatal: nothing in the sandbox is retried.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum BootstrapError {
    /// Failed to create a directory.
    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    CreateDirectory {
        /// Directory that could not be created.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Failed to write a generated artifact (configuration file, key, or certificate).
    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    WriteArtifact {
        /// Path of the artifact.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Failed to read back a certificate artifact.
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    ReadArtifact {
        /// Path of the artifact.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// The certificate toolchain could not be launched.
    #[snafu(display("Failed to launch certificate toolchain for step '{}': {}", step, source))]
    LaunchCertificateTool {
        /// Name of the issuance step.
        step: &'static str,

        /// Error source.
        source: io::Error,
    },

    /// The certificate toolchain exited with a non-zero status.
    #[snafu(display("Certificate step '{}' failed with exit code {}: {}", step, exit_code, stderr))]
    CertificateToolFailed {
        /// Name of the issuance step.
        step: &'static str,

        /// Exit code of the toolchain, or -1 if it was killed by a signal.
        exit_code: i32,

        /// Captured standard error of the toolchain.
        stderr: String,
    },

    /// Certificate issuance or verification failed in-process.
    #[snafu(display("Certificate step '{}' failed: {}", step, source))]
    CertificateIssuance {
        /// Name of the issuance step.
        step: &'static str,

        /// Error source.
        source: GenericError,
    },

    /// The sandbox configuration is invalid.
    #[snafu(display("Invalid configuration: {}", reason))]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// Failed to render a discovery agent configuration document.
    #[snafu(display("Failed to render '{}': {}", path.display(), source))]
    Render {
        /// Path of the document being rendered.
        path: PathBuf,

        /// Error source.
        source: serde_json::Error,
    },

    /// Failed to spawn a process.
    #[snafu(display("Failed to spawn '{}' ({}): {}", process_id, program.display(), source))]
    Spawn {
        /// Identifier of the process.
        process_id: String,

        /// Program that was being launched.
        program: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Failed to reap a process during shutdown.
    #[snafu(display("Failed to reap '{}': {}", process_id, source))]
    Reap {
        /// Identifier of the process.
        process_id: String,

        /// Error source.
        source: io::Error,
    },
}

impl BootstrapError {
    /// Returns the category of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CreateDirectory { .. } | Self::WriteArtifact { .. } => FailureKind::Provisioning,
            Self::ReadArtifact { .. }
            | Self::LaunchCertificateTool { .. }
            | Self::CertificateToolFailed { .. }
            | Self::CertificateIssuance { .. } => FailureKind::Certificate,
            Self::Configuration { .. } | Self::Render { .. } => FailureKind::Configuration,
            Self::Spawn { .. } => FailureKind::Spawn,
            Self::Reap { .. } => FailureKind::Shutdown,
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }
}
