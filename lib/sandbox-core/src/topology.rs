//! Deterministic service topology.
//!
//! A topology is derived from an ordered table of [`ServiceRule`]s. Every service, whatever its family, draws the next
//! value from a single shared sequence: that value is both its ordinal (`<tag>-<n>`) and its port offset. Generating
//! the same rule table twice therefore always yields the exact same descriptors, in the same order.

use std::{
    ffi::OsString,
    fmt,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;

/// Health check protocol spoken by a service.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProtocolKind {
    /// Checked over HTTP, by polling `/health`.
    Http,

    /// Checked over gRPC when TLS is enabled, plain TCP otherwise.
    Grpc,

    /// Checked by opening a TCP connection.
    Tcp,
}

impl ProtocolKind {
    /// Returns the canonical name of this protocol.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "grpc" => Ok(Self::Grpc),
            "tcp" => Ok(Self::Tcp),
            other => Err(BootstrapError::configuration(format!(
                "unknown service check protocol '{}' (expected one of: http, grpc, tcp)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ProtocolKind {
    type Error = BootstrapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProtocolKind> for String {
    fn from(kind: ProtocolKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A rule describing one family of services.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceRule {
    /// Logical family name, such as `index-store`.
    pub tag: String,

    /// Number of instances to generate.
    pub count: u16,

    /// Executable to launch for each instance.
    pub executable: PathBuf,

    /// Health check protocol.
    pub kind: ProtocolKind,

    /// Whether each instance owns exclusive storage.
    #[serde(default)]
    pub stateful: bool,
}

impl ServiceRule {
    /// Creates a rule for services owning exclusive storage.
    pub fn stateful<T, E>(tag: T, count: u16, executable: E, kind: ProtocolKind) -> Self
    where
        T: Into<String>,
        E: Into<PathBuf>,
    {
        Self {
            tag: tag.into(),
            count,
            executable: executable.into(),
            kind,
            stateful: true,
        }
    }

    /// Creates a rule for services without storage.
    pub fn stateless<T, E>(tag: T, count: u16, executable: E, kind: ProtocolKind) -> Self
    where
        T: Into<String>,
        E: Into<PathBuf>,
    {
        Self {
            stateful: false,
            ..Self::stateful(tag, count, executable, kind)
        }
    }
}

/// Returns the default rule table.
///
/// Stateful families come first so that storage services are spawned before the gateways that depend on them.
pub fn default_rules() -> Vec<ServiceRule> {
    vec![
        ServiceRule::stateful("index-store", 11, "gunkan-index-store-rocksdb", ProtocolKind::Grpc),
        ServiceRule::stateful("blob-store", 11, "gunkan-blob-store-fs", ProtocolKind::Http),
        ServiceRule::stateless("index-gate", 7, "gunkan-index-gate", ProtocolKind::Grpc),
        ServiceRule::stateless("data-gate", 5, "gunkan-data-gate", ProtocolKind::Http),
    ]
}

/// On-disk layout of a sandbox.
///
/// ```text
/// <base>/
///   sandbox.pid
///   data/<tag>-<n>/          one per stateful service
///   data/consul-0/           discovery agent state
///   etc/                     certificate bundle, shared by every service
///   etc/consul-0.json        discovery agent root configuration
///   etc/consul-0.d/          one check definition per service
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    base_dir: PathBuf,
}

impl Layout {
    /// Name of the discovery agent instance.
    pub const AGENT_ID: &'static str = "consul-0";

    /// Creates a layout rooted at `base_dir`.
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the directory holding every storage volume.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Returns the shared configuration directory.
    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("etc")
    }

    /// Returns the storage volume of the service with the given identifier.
    pub fn volume_for(&self, id: &str) -> PathBuf {
        self.data_dir().join(id)
    }

    /// Returns the path of the discovery agent root configuration.
    pub fn agent_config_file(&self) -> PathBuf {
        self.config_dir().join(format!("{}.json", Self::AGENT_ID))
    }

    /// Returns the directory holding per-service check definitions.
    pub fn agent_check_dir(&self) -> PathBuf {
        self.config_dir().join(format!("{}.d", Self::AGENT_ID))
    }

    /// Returns the discovery agent data directory.
    pub fn agent_data_dir(&self) -> PathBuf {
        self.data_dir().join(Self::AGENT_ID)
    }

    /// Returns the path of the check definition for the service with the given identifier.
    pub fn check_file_for(&self, id: &str) -> PathBuf {
        self.agent_check_dir().join(format!("srv-{}.json", id))
    }

    /// Returns the path of the harness PID file.
    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("sandbox.pid")
    }
}

/// A single service instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceDescriptor {
    /// Logical family name.
    pub tag: String,

    /// Health check protocol.
    pub kind: ProtocolKind,

    /// Unique identifier, `<tag>-<n>`.
    pub id: String,

    /// Name registered in the discovery agent.
    ///
    /// Stateless instances share their family name. Stateful instances are registered under their own identifier,
    /// since each one owns distinct data.
    pub service_name: String,

    /// Listening address.
    pub address: IpAddr,

    /// Listening port.
    pub port: u16,

    /// Executable to launch.
    pub executable: PathBuf,

    /// Exclusive storage directory. Only present for stateful services.
    pub volume: Option<PathBuf>,

    /// Directory holding TLS material and shared configuration.
    pub config_dir: PathBuf,
}

impl ServiceDescriptor {
    /// Returns `true` if this service owns exclusive storage.
    pub fn is_stateful(&self) -> bool {
        self.volume.is_some()
    }

    /// Returns the network endpoint of this service.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Builds the arguments the service is launched with.
    ///
    /// The calling convention is `<addr:port> [--tls <config_dir>] [<volume>]`, with the volume always last.
    pub fn command_args(&self, tls: bool) -> Vec<OsString> {
        let mut args = vec![OsString::from(self.endpoint().to_string())];
        if tls {
            args.push(OsString::from("--tls"));
            args.push(self.config_dir.clone().into_os_string());
        }
        if let Some(volume) = &self.volume {
            args.push(volume.clone().into_os_string());
        }
        args
    }
}

/// Generator of service descriptors.
///
/// Each call to [`iter`][Self::iter] starts over from the first rule with a fresh sequence, so every iteration
/// produces an identical series of descriptors.
#[derive(Clone, Debug)]
pub struct TopologyGenerator {
    rules: Arc<[ServiceRule]>,
    address: IpAddr,
    base_port: u16,
    layout: Layout,
}

impl TopologyGenerator {
    /// Creates a new `TopologyGenerator`.
    ///
    /// # Errors
    ///
    /// If a rule has an empty tag, if a tag would place files outside the sandbox directories, or if the rule table
    /// would assign a port beyond 65535, an error is returned.
    pub fn new(rules: Vec<ServiceRule>, address: IpAddr, base_port: u16, layout: Layout) -> Result<Self, BootstrapError> {
        if let Some(rule) = rules.iter().find(|rule| rule.tag.trim().is_empty()) {
            return Err(BootstrapError::configuration(format!(
                "service rule for '{}' has an empty tag",
                rule.executable.display()
            )));
        }

        // Tags become file and directory names under the layout.
        if let Some(rule) = rules
            .iter()
            .find(|rule| rule.tag.contains(['/', '\\']) || rule.tag.contains(".."))
        {
            return Err(BootstrapError::configuration(format!(
                "service rule tag '{}' must not contain path separators or '..'",
                rule.tag
            )));
        }

        let total = rules.iter().map(|rule| u32::from(rule.count)).sum::<u32>();
        if total > 0 && u32::from(base_port) + total - 1 > u32::from(u16::MAX) {
            return Err(BootstrapError::configuration(format!(
                "{} services starting at port {} would exceed the port range",
                total, base_port
            )));
        }

        Ok(Self {
            rules: rules.into(),
            address,
            base_port,
            layout,
        })
    }

    /// Returns the layout used for storage and configuration paths.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns a fresh iterator over the generated descriptors.
    pub fn iter(&self) -> Descriptors<'_> {
        Descriptors {
            generator: self,
            rule_index: 0,
            emitted_for_rule: 0,
            sequence: 0,
        }
    }

    fn describe(&self, rule: &ServiceRule, sequence: u16) -> ServiceDescriptor {
        let id = format!("{}-{}", rule.tag, sequence);
        let (service_name, volume) = if rule.stateful {
            (id.clone(), Some(self.layout.volume_for(&id)))
        } else {
            (rule.tag.clone(), None)
        };

        ServiceDescriptor {
            tag: rule.tag.clone(),
            kind: rule.kind,
            service_name,
            address: self.address,
            // Bounds were checked when the generator was built.
            port: self.base_port + sequence,
            executable: rule.executable.clone(),
            volume,
            config_dir: self.layout.config_dir(),
            id,
        }
    }
}

/// Iterator over generated service descriptors.
pub struct Descriptors<'a> {
    generator: &'a TopologyGenerator,
    rule_index: usize,
    emitted_for_rule: u16,
    sequence: u16,
}

impl Iterator for Descriptors<'_> {
    type Item = ServiceDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let rule = self.generator.rules.get(self.rule_index)?;
            if self.emitted_for_rule < rule.count {
                let descriptor = self.generator.describe(rule, self.sequence);
                self.emitted_for_rule += 1;
                self.sequence = self.sequence.wrapping_add(1);
                return Some(descriptor);
            }

            self.rule_index += 1;
            self.emitted_for_rule = 0;
        }
    }
}

/// A materialized topology.
///
/// Computed once and shared by provisioning, rendering and spawning, so that every pass sees the exact same services.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    services: Vec<ServiceDescriptor>,
}

impl Topology {
    /// Materializes every descriptor produced by `generator`.
    pub fn materialize(generator: &TopologyGenerator) -> Self {
        Self {
            services: generator.iter().collect(),
        }
    }

    /// Returns the services, in generation order.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Returns the number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if there are no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns the service with the given identifier, if any.
    pub fn get(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|service| service.id == id)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::Ipv4Addr};

    use super::*;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn default_generator() -> TopologyGenerator {
        TopologyGenerator::new(default_rules(), LOOPBACK, 6000, Layout::new("/tmp/gunkan")).unwrap()
    }

    #[test]
    fn replay_is_identical() {
        let generator = default_generator();

        let first = generator.iter().collect::<Vec<_>>();
        let second = generator.iter().collect::<Vec<_>>();
        let rebuilt = default_generator().iter().collect::<Vec<_>>();

        assert_eq!(first.len(), 34);
        assert_eq!(first, second);
        assert_eq!(first, rebuilt);
    }

    #[test]
    fn ports_are_distinct_and_increasing() {
        let topology = Topology::materialize(&default_generator());

        let ports = topology.services().iter().map(|s| s.port).collect::<Vec<_>>();
        assert!(ports.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(ports.first(), Some(&6000));
        assert_eq!(ports.last(), Some(&6033));
    }

    #[test]
    fn volumes_follow_statefulness() {
        let topology = Topology::materialize(&default_generator());

        let mut volumes = HashSet::new();
        for service in topology.services() {
            match (&service.volume, service.tag.as_str()) {
                (Some(volume), "index-store" | "blob-store") => {
                    assert!(!volume.as_os_str().is_empty());
                    assert!(volumes.insert(volume.clone()), "duplicate volume {}", volume.display());
                    assert_eq!(service.service_name, service.id);
                }
                (None, "index-gate" | "data-gate") => assert_eq!(service.service_name, service.tag),
                (volume, tag) => panic!("unexpected volume {:?} for tag {}", volume, tag),
            }
        }
        assert_eq!(volumes.len(), 22);
    }

    #[test]
    fn three_index_stores() {
        let rules = vec![ServiceRule::stateful(
            "index-store",
            3,
            "gunkan-index-store-rocksdb",
            ProtocolKind::Grpc,
        )];
        let generator = TopologyGenerator::new(rules, LOOPBACK, 6000, Layout::new("/tmp/gunkan")).unwrap();
        let topology = Topology::materialize(&generator);

        let summary = topology
            .services()
            .iter()
            .map(|s| (s.id.as_str(), s.port, s.volume.clone().unwrap(), s.service_name.as_str()))
            .collect::<Vec<_>>();

        assert_eq!(
            summary,
            vec![
                ("index-store-0", 6000, PathBuf::from("/tmp/gunkan/data/index-store-0"), "index-store-0"),
                ("index-store-1", 6001, PathBuf::from("/tmp/gunkan/data/index-store-1"), "index-store-1"),
                ("index-store-2", 6002, PathBuf::from("/tmp/gunkan/data/index-store-2"), "index-store-2"),
            ]
        );
    }

    #[test]
    fn ordinals_come_from_the_shared_sequence() {
        let rules = vec![
            ServiceRule::stateful("index-store", 2, "a", ProtocolKind::Grpc),
            ServiceRule::stateless("data-gate", 2, "b", ProtocolKind::Http),
        ];
        let generator = TopologyGenerator::new(rules, LOOPBACK, 7000, Layout::new("/srv")).unwrap();

        let ids = generator.iter().map(|s| (s.id, s.port)).collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![
                ("index-store-0".to_string(), 7000),
                ("index-store-1".to_string(), 7001),
                ("data-gate-2".to_string(), 7002),
                ("data-gate-3".to_string(), 7003),
            ]
        );
    }

    #[test]
    fn command_args_follow_convention() {
        let topology = Topology::materialize(&default_generator());

        let store = topology.get("index-store-0").unwrap();
        assert_eq!(
            store.command_args(true),
            vec![
                OsString::from("127.0.0.1:6000"),
                OsString::from("--tls"),
                OsString::from("/tmp/gunkan/etc"),
                OsString::from("/tmp/gunkan/data/index-store-0"),
            ]
        );

        let gate = topology.get("data-gate-33").unwrap();
        assert_eq!(gate.command_args(false), vec![OsString::from("127.0.0.1:6033")]);
    }

    #[test]
    fn rejects_port_overflow() {
        let rules = vec![ServiceRule::stateless("data-gate", 10, "gate", ProtocolKind::Http)];

        assert!(TopologyGenerator::new(rules.clone(), LOOPBACK, 65526, Layout::new("/tmp")).is_ok());
        let err = TopologyGenerator::new(rules, LOOPBACK, 65527, Layout::new("/tmp")).unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Configuration);
    }

    #[test]
    fn rejects_tags_escaping_the_layout() {
        for tag in ["../x", "a/b", "a\\b", ".."] {
            let rules = vec![ServiceRule::stateful(tag, 1, "store", ProtocolKind::Http)];
            let err = TopologyGenerator::new(rules, LOOPBACK, 6000, Layout::new("/tmp")).unwrap_err();
            assert_eq!(err.kind(), crate::FailureKind::Configuration, "tag {:?}", tag);
        }

        let rules = vec![ServiceRule::stateful("index.store", 1, "store", ProtocolKind::Http)];
        assert!(TopologyGenerator::new(rules, LOOPBACK, 6000, Layout::new("/tmp")).is_ok());
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = "udp".parse::<ProtocolKind>().unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::Configuration);
        assert_eq!("GRPC".parse::<ProtocolKind>().unwrap(), ProtocolKind::Grpc);
    }
}
