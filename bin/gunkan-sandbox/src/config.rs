use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use sandbox_core::{
    registry::{AgentSettings, CheckSettings},
    topology::{default_rules, ServiceRule},
};
use sandbox_error::{ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(global = true, short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Path to the configuration file.
    ///
    /// When not specified, the default topology is used.
    #[arg(global = true, short = 'c', long = "config")]
    pub config_file: Option<PathBuf>,

    /// Base directory of the sandbox, overriding the configuration file.
    #[arg(global = true, long)]
    pub base_dir: Option<PathBuf>,

    /// Enable TLS between services.
    #[arg(global = true, long, overrides_with = "no_tls")]
    tls: bool,

    /// Disable TLS between services.
    #[arg(global = true, long, overrides_with = "tls")]
    no_tls: bool,

    /// Certificate authority implementation, overriding the configuration file.
    #[arg(global = true, long, value_enum)]
    pub cert_authority: Option<AuthorityKind>,

    /// Subcommand to run. Defaults to `run`.
    #[command(subcommand)]
    pub action: Option<Action>,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Returns the TLS setting requested on the command line, if any.
    pub fn tls_override(&self) -> Option<bool> {
        match (self.tls, self.no_tls) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// Loads the configuration file, if any, and applies command-line overrides on top of it.
    pub fn load_config(&self) -> Result<SandboxConfig, GenericError> {
        let mut config = match &self.config_file {
            Some(path) => SandboxConfig::try_from_file(path)?,
            None => SandboxConfig::default(),
        };

        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        if let Some(tls) = self.tls_override() {
            config.tls = tls;
        }
        if let Some(cert_authority) = self.cert_authority {
            config.cert_authority = cert_authority;
        }

        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Subcommand)]
pub enum Action {
    /// Provision the sandbox, spawn every service, and supervise them until interrupted.
    Run,

    /// Print the generated topology without touching the filesystem.
    Plan,

    /// Provision the sandbox and render its configuration, without spawning anything.
    Render,
}

/// Certificate authority implementation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityKind {
    /// Drive the `openssl` command-line toolchain.
    #[default]
    Openssl,

    /// Issue certificates in-process.
    Native,
}

/// A duration that can be parsed from human-readable strings like "10s", "1m", "500ms".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HumanDuration(pub Duration);

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map(HumanDuration).map_err(serde::de::Error::custom)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut number = String::new();
        while let Some(digit) = chars.next_if(char::is_ascii_digit) {
            number.push(digit);
        }
        if number.is_empty() {
            return Err(format!("unexpected character '{}'", c));
        }
        let value: u64 = number.parse().map_err(|_| format!("invalid number: {}", number))?;

        let mut unit = String::new();
        while let Some(letter) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            unit.push(letter);
        }

        let part = match unit.as_str() {
            "ms" => Some(Duration::from_millis(value)),
            // A bare number is taken as seconds.
            "" | "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            _ => return Err(format!("unknown duration unit: {}", unit)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration is too large: {}", s))?;
    }

    Ok(total)
}

/// Sandbox configuration.
///
/// Every field is optional. Missing fields take the defaults that reproduce the reference topology.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    /// Base directory holding all data and configuration.
    pub base_dir: PathBuf,

    /// Address every service and the discovery agent bind to.
    pub address: IpAddr,

    /// Port of the first service. Each following service takes the next port.
    pub base_port: u16,

    /// Whether services talk to each other over TLS.
    pub tls: bool,

    /// Certificate authority implementation.
    pub cert_authority: AuthorityKind,

    /// Path of the `openssl` toolchain, used by the `openssl` certificate authority.
    pub openssl_path: PathBuf,

    /// How long processes are given to exit on shutdown before being killed.
    pub shutdown_grace_period: HumanDuration,

    /// Discovery agent settings.
    pub agent: AgentSettings,

    /// Health check timing.
    pub check: CheckSettings,

    /// Service rule table, in spawn order.
    pub services: Vec<ServiceRule>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/gunkan"),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 6000,
            tls: true,
            cert_authority: AuthorityKind::default(),
            openssl_path: PathBuf::from("openssl"),
            shutdown_grace_period: HumanDuration(Duration::from_secs(10)),
            agent: AgentSettings::default(),
            check: CheckSettings::default(),
            services: default_rules(),
        }
    }
}

impl SandboxConfig {
    /// Attempts to load a serialized `SandboxConfig` from the given file path.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or if it is not a valid configuration, an error is returned.
    pub fn try_from_file<P>(config_path: P) -> Result<Self, GenericError>
    where
        P: AsRef<Path>,
    {
        let config_path = config_path.as_ref();
        let config_file_raw = std::fs::read_to_string(config_path)
            .with_error_context(|| format!("Failed to read configuration file '{}'.", config_path.display()))?;

        Self::try_from_yaml(&config_file_raw)
    }

    fn try_from_yaml(raw: &str) -> Result<Self, GenericError> {
        serde_yaml::from_str(raw).error_context("Failed to parse configuration file.")
    }
}
