//! Process supervision.
//!
//! The supervisor owns every child process of the sandbox for its whole life: it spawns them in order, idles until
//! termination is requested, then signals and reaps all of them. Children are never restarted.

use std::{
    ffi::OsString,
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use indexmap::IndexMap;
use sandbox_app::prelude::TerminationRequest;
use snafu::ResultExt as _;
use tokio::{
    process::{Child, Command},
    select,
    time::{interval, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{BootstrapError, Spawn},
    registry::AgentSettings,
    topology::{Layout, ServiceDescriptor},
};

const MIN_IDLE_TICK: Duration = Duration::from_millis(10);

/// Lifecycle state of a [`Supervisor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisorState {
    /// Nothing has been spawned yet.
    Idle,

    /// Processes are being spawned.
    Spawning,

    /// Every process was spawned, and the supervisor is waiting for termination to be requested.
    Running,

    /// Processes are being terminated and reaped.
    ShuttingDown,

    /// Every process was reaped.
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A process to spawn.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpec {
    /// Unique identifier of the process.
    pub id: String,

    /// Program to execute.
    pub program: PathBuf,

    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl ProcessSpec {
    /// Creates a new `ProcessSpec`.
    pub fn new<I, P, A>(id: I, program: P, args: A) -> Self
    where
        I: Into<String>,
        P: Into<PathBuf>,
        A: IntoIterator,
        A::Item: Into<OsString>,
    {
        Self {
            id: id.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Describes the process launching `service`.
    pub fn for_service(service: &ServiceDescriptor, tls: bool) -> Self {
        Self::new(service.id.clone(), service.executable.clone(), service.command_args(tls))
    }

    /// Describes the process launching the discovery agent, pointed at the configuration rendered under `layout`.
    pub fn for_agent(settings: &AgentSettings, layout: &Layout) -> Self {
        let mut args = vec![
            OsString::from("agent"),
            OsString::from("-server"),
            OsString::from("-bootstrap"),
            OsString::from("-dev"),
        ];
        if settings.ui {
            args.push(OsString::from("-ui"));
        }
        args.push(OsString::from("-config-file"));
        args.push(layout.agent_config_file().into_os_string());
        args.push(OsString::from("-config-dir"));
        args.push(layout.agent_check_dir().into_os_string());

        Self::new(Layout::AGENT_ID, settings.executable.clone(), args)
    }
}

/// Supervisor settings.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// How long processes are given to exit after being asked to terminate, before being killed.
    pub grace_period: Duration,

    /// How often exited processes are looked for while running.
    pub idle_tick: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            idle_tick: Duration::from_secs(1),
        }
    }
}

/// Outcome of a shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Exit status of every reaped process, in spawn order.
    pub statuses: IndexMap<String, ExitStatus>,

    /// Processes that outlived the grace period and had to be killed.
    pub forced: Vec<String>,
}

struct TrackedProcess {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
}

/// Process supervisor.
pub struct Supervisor {
    settings: SupervisorSettings,
    state: SupervisorState,
    processes: IndexMap<String, TrackedProcess>,
}

impl Supervisor {
    /// Creates a new, idle `Supervisor`.
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            state: SupervisorState::Idle,
            processes: IndexMap::new(),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Returns the number of tracked processes.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    /// Returns `true` if no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Returns the PID the given process was spawned with.
    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.get(id).and_then(|process| process.pid)
    }

    /// Returns the exit status of the given process, if it is known to have exited.
    pub fn exit_status(&self, id: &str) -> Option<ExitStatus> {
        self.processes.get(id).and_then(|process| process.exit)
    }

    /// Spawns every process in `specs`, in order.
    ///
    /// # Errors
    ///
    /// If any process fails to spawn, every process spawned so far is shut down and reaped before the spawn error is
    /// returned. Duplicate identifiers are rejected before anything is spawned.
    pub async fn spawn_all(&mut self, specs: &[ProcessSpec]) -> Result<(), BootstrapError> {
        for (i, spec) in specs.iter().enumerate() {
            if self.processes.contains_key(&spec.id) || specs[..i].iter().any(|other| other.id == spec.id) {
                return Err(BootstrapError::configuration(format!(
                    "process identifier '{}' is used more than once",
                    spec.id
                )));
            }
        }

        self.state = SupervisorState::Spawning;
        info!(processes = specs.len(), "Spawning processes...");

        for spec in specs {
            if let Err(e) = self.spawn(spec) {
                error!(service_id = %spec.id, error = %e, "Failed to spawn process. Shutting down...");
                if let Err(shutdown_error) = self.shutdown().await {
                    error!(error = %shutdown_error, "Failed to cleanly shut down after spawn failure.");
                }
                return Err(e);
            }
        }

        self.state = SupervisorState::Running;
        Ok(())
    }

    fn spawn(&mut self, spec: &ProcessSpec) -> Result<(), BootstrapError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context(Spawn {
                process_id: &spec.id,
                program: &spec.program,
            })?;

        let pid = child.id();
        debug!(service_id = %spec.id, pid, program = %spec.program.display(), args = ?spec.args, "Spawned process.");

        self.processes.insert(spec.id.clone(), TrackedProcess { child, pid, exit: None });
        Ok(())
    }

    /// Idles until `termination` resolves.
    ///
    /// Processes exiting in the meantime are logged, but not restarted.
    pub async fn run_until(&mut self, termination: &mut TerminationRequest) {
        self.state = SupervisorState::Running;
        info!(processes = self.processes.len(), "Sandbox running. Waiting for termination request...");

        let mut ticker = interval(self.settings.idle_tick.max(MIN_IDLE_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = termination.wait() => break,
                _ = ticker.tick() => self.observe_exits(),
            }
        }
    }

    fn observe_exits(&mut self) {
        for (id, process) in self.processes.iter_mut().filter(|(_, p)| p.exit.is_none()) {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(service_id = %id, pid = process.pid, %status, "Process exited early. It will not be restarted.");
                    process.exit = Some(status);
                }
                Ok(None) => {}
                Err(e) => warn!(service_id = %id, pid = process.pid, error = %e, "Failed to query process status."),
            }
        }
    }

    /// Terminates and reaps every tracked process.
    ///
    /// All processes are asked to terminate before waiting on any of them. Processes still running once the grace
    /// period elapses are killed.
    ///
    /// # Errors
    ///
    /// If a process cannot be reaped, an error is returned once every other process has been dealt with.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, BootstrapError> {
        self.state = SupervisorState::ShuttingDown;
        info!(processes = self.processes.len(), grace_period = ?self.settings.grace_period, "Terminating processes...");

        self.observe_exits();
        for (id, process) in self.processes.iter().filter(|(_, p)| p.exit.is_none()) {
            if let Some(pid) = process.pid {
                match send_terminate(pid) {
                    Ok(()) => debug!(service_id = %id, pid, "Sent SIGTERM."),
                    Err(e) => debug!(service_id = %id, pid, error = %e, "Failed to send SIGTERM."),
                }
            }
        }

        // A grace period too large to express as a deadline means waiting without bound.
        let deadline = Instant::now().checked_add(self.settings.grace_period);
        let mut report = ShutdownReport::default();
        let mut first_error = None;

        for (id, process) in self.processes.iter_mut() {
            if let Some(status) = process.exit {
                report.statuses.insert(id.clone(), status);
                continue;
            }

            let waited = match deadline {
                Some(deadline) => timeout_at(deadline, process.child.wait()).await,
                None => Ok(process.child.wait().await),
            };
            let reaped = match waited {
                Ok(result) => result,
                Err(_) => {
                    warn!(service_id = %id, pid = process.pid, "Process did not exit within grace period. Killing...");
                    report.forced.push(id.clone());
                    if let Err(e) = process.child.start_kill() {
                        debug!(service_id = %id, error = %e, "Failed to send SIGKILL.");
                    }
                    process.child.wait().await
                }
            };

            match reaped {
                Ok(status) => {
                    debug!(service_id = %id, pid = process.pid, %status, "Reaped process.");
                    process.exit = Some(status);
                    report.statuses.insert(id.clone(), status);
                }
                Err(e) => {
                    error!(service_id = %id, pid = process.pid, error = %e, "Failed to reap process.");
                    if first_error.is_none() {
                        first_error = Some(BootstrapError::Reap {
                            process_id: id.clone(),
                            source: e,
                        });
                    }
                }
            }
        }

        self.state = SupervisorState::Terminated;
        info!(
            reaped = report.statuses.len(),
            forced = report.forced.len(),
            "All processes terminated."
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn send_terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: `kill` has no memory safety requirements, and the PID belongs to a child that has not been reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Runs the full supervision lifecycle: spawns `specs`, waits for `termination`, then shuts everything down.
///
/// # Errors
///
/// If a process fails to spawn, or if a process cannot be reaped, an error is returned. In both cases, every process
/// that was spawned has been dealt with by the time this returns.
pub async fn supervise(
    specs: &[ProcessSpec], settings: SupervisorSettings, termination: &mut TerminationRequest,
) -> Result<ShutdownReport, BootstrapError> {
    let mut supervisor = Supervisor::new(settings);
    supervisor.spawn_all(specs).await?;
    supervisor.run_until(termination).await;
    supervisor.shutdown().await
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        os::unix::process::ExitStatusExt as _,
    };

    use tokio::time::sleep;

    use super::*;
    use crate::{
        topology::{ProtocolKind, ServiceRule, Topology, TopologyGenerator},
        FailureKind,
    };

    fn shell(id: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(id, "/bin/sh", ["-c", script])
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            grace_period: Duration::from_secs(5),
            idle_tick: Duration::from_millis(20),
        }
    }

    fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn service_spec_uses_launch_convention() {
        let layout = Layout::new("/tmp/gunkan");
        let rules = vec![ServiceRule::stateful("blob-store", 1, "gunkan-blob-store-fs", ProtocolKind::Http)];
        let generator =
            TopologyGenerator::new(rules, IpAddr::V4(Ipv4Addr::LOCALHOST), 6000, layout.clone()).unwrap();
        let topology = Topology::materialize(&generator);

        let spec = ProcessSpec::for_service(&topology.services()[0], true);
        assert_eq!(spec.id, "blob-store-0");
        assert_eq!(spec.program, PathBuf::from("gunkan-blob-store-fs"));
        assert_eq!(
            spec.args,
            vec![
                OsString::from("127.0.0.1:6000"),
                OsString::from("--tls"),
                OsString::from("/tmp/gunkan/etc"),
                OsString::from("/tmp/gunkan/data/blob-store-0"),
            ]
        );
    }

    #[test]
    fn agent_spec() {
        let spec = ProcessSpec::for_agent(&AgentSettings::default(), &Layout::new("/tmp/gunkan"));

        assert_eq!(spec.id, "consul-0");
        assert_eq!(spec.program, PathBuf::from("consul"));
        assert_eq!(
            spec.args,
            [
                "agent",
                "-server",
                "-bootstrap",
                "-dev",
                "-ui",
                "-config-file",
                "/tmp/gunkan/etc/consul-0.json",
                "-config-dir",
                "/tmp/gunkan/etc/consul-0.d",
            ]
            .iter()
            .map(OsString::from)
            .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn terminates_and_reaps_every_process() {
        let dir = tempfile::tempdir().unwrap();
        let argv_log = dir.path().join("argv.log");
        let record = format!("echo \"$@\" >> '{}'; exec sleep 30", argv_log.display());

        let specs = vec![
            ProcessSpec::new("index-store-0", "/bin/sh", ["-c", record.as_str(), "sh", "127.0.0.1:6000", "/data/0"]),
            ProcessSpec::new("data-gate-1", "/bin/sh", ["-c", record.as_str(), "sh", "127.0.0.1:6001"]),
        ];

        let mut supervisor = Supervisor::new(fast_settings());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        supervisor.spawn_all(&specs).await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);
        assert_eq!(supervisor.len(), 2);

        let (mut termination, handle) = TerminationRequest::paired();
        let trigger = tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            handle.trigger();
        });
        supervisor.run_until(&mut termination).await;
        trigger.await.unwrap();

        let pids = ["index-store-0", "data-gate-1"].map(|id| supervisor.pid(id).unwrap());
        let report = supervisor.shutdown().await.unwrap();

        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert!(report.forced.is_empty());
        assert_eq!(report.statuses.keys().collect::<Vec<_>>(), ["index-store-0", "data-gate-1"]);
        for status in report.statuses.values() {
            assert_eq!(status.signal(), Some(libc::SIGTERM));
        }
        for pid in pids {
            assert!(!is_alive(pid), "process {} is still alive", pid);
        }

        let mut recorded = std::fs::read_to_string(&argv_log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect::<Vec<_>>();
        recorded.sort();
        assert_eq!(recorded, ["127.0.0.1:6000 /data/0", "127.0.0.1:6001"]);
    }

    #[tokio::test]
    async fn kills_processes_ignoring_sigterm() {
        let specs = vec![shell("stubborn", "trap '' TERM; exec sleep 30"), shell("polite", "exec sleep 30")];
        let settings = SupervisorSettings {
            grace_period: Duration::from_millis(200),
            ..fast_settings()
        };

        // Give the shell time to install its trap before termination is requested.
        let mut termination = TerminationRequest::wrapped(sleep(Duration::from_millis(300)));
        let report = supervise(&specs, settings, &mut termination).await.unwrap();

        assert_eq!(report.forced, ["stubborn"]);
        assert_eq!(report.statuses["stubborn"].signal(), Some(libc::SIGKILL));
        assert_eq!(report.statuses["polite"].signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn unbounded_grace_period_waits_for_exit() {
        let specs = vec![shell("index-store-0", "exec sleep 30"), shell("data-gate-1", "exec sleep 30")];
        let settings = SupervisorSettings {
            grace_period: Duration::MAX,
            ..fast_settings()
        };

        let mut termination = TerminationRequest::wrapped(sleep(Duration::from_millis(200)));
        let report = supervise(&specs, settings, &mut termination).await.unwrap();

        assert!(report.forced.is_empty());
        assert_eq!(report.statuses.len(), 2);
        for status in report.statuses.values() {
            assert_eq!(status.signal(), Some(libc::SIGTERM));
        }
    }

    #[tokio::test]
    async fn early_exit_is_observed_but_not_restarted() {
        let specs = vec![shell("short-lived", "exit 3"), shell("long-lived", "exec sleep 30")];

        let mut supervisor = Supervisor::new(fast_settings());
        supervisor.spawn_all(&specs).await.unwrap();

        let mut termination = TerminationRequest::wrapped(sleep(Duration::from_millis(300)));
        supervisor.run_until(&mut termination).await;

        let early = supervisor.exit_status("short-lived").unwrap();
        assert_eq!(early.code(), Some(3));
        assert!(supervisor.exit_status("long-lived").is_none());

        let report = supervisor.shutdown().await.unwrap();
        assert_eq!(report.statuses["short-lived"].code(), Some(3));
        assert_eq!(report.statuses.len(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_reaps_started_processes() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            shell("index-store-0", "exec sleep 30"),
            ProcessSpec::new("index-store-1", dir.path().join("missing-binary"), Vec::<OsString>::new()),
            shell("index-store-2", "exec sleep 30"),
        ];

        let mut supervisor = Supervisor::new(fast_settings());
        let err = supervisor.spawn_all(&specs).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Spawn);
        assert!(err.to_string().contains("index-store-1"));
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        assert_eq!(supervisor.len(), 1);
        assert!(supervisor.exit_status("index-store-0").is_some());
        assert!(!is_alive(supervisor.pid("index-store-0").unwrap()));
    }

    #[tokio::test]
    async fn duplicate_identifiers_are_rejected() {
        let specs = vec![shell("consul-0", "exec sleep 30"), shell("consul-0", "exec sleep 30")];

        let mut supervisor = Supervisor::new(fast_settings());
        let err = supervisor.spawn_all(&specs).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Configuration);
        assert!(supervisor.is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }
}
