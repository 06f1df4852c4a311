//! Child-process supervision: launch with parent context, shutdown with a
//! timed escalation that a stuck child cannot stall.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use plexus_net_utils::NodeAddress;
use plexus_protocol::{
    ErrorCode, ExchangeId, InterfaceId, Version, PARENT_EXCHANGE_ID_VARIABLE,
};
use tokio::process::Child;

/// How long a freshly launched child gets to come back with its offer.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit codes a hosted child reports to its supervisor.
pub mod exit_code {
    /// Clean shutdown.
    pub const SUCCESS: i32 = 0;
    /// The hosted object could not be created.
    pub const LAUNCH_FAILED: i32 = 1;
    /// The parent never answered the offer announce.
    pub const ANNOUNCE_TIMEOUT: i32 = 2;
    /// The parent refused the offered object.
    pub const REJECTED: i32 = 3;
}

/// Launch description for one out-of-process component.
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    /// Hosting binary to execute.
    pub binary: Utf8PathBuf,
    /// Class the host should instantiate and offer.
    pub class_name: String,
    /// Interface the offered object must implement.
    pub interface: InterfaceId,
    /// Requested interface version.
    pub version: Version,
    /// Human tag for diagnostics; defaults to the class name.
    pub callsign: String,
    /// Directory of proxy-stub libraries the child should load.
    pub proxy_stub_path: Option<Utf8PathBuf>,
    /// Extra arguments appended verbatim.
    pub args: Vec<String>,
}

impl ProcessConfig {
    /// A config for `binary` hosting `class_name`.
    pub fn new(
        binary: impl Into<Utf8PathBuf>,
        class_name: impl Into<String>,
        interface: InterfaceId,
    ) -> Self {
        let class_name = class_name.into();
        Self {
            binary: binary.into(),
            callsign: class_name.clone(),
            class_name,
            interface,
            version: Version::ANY,
            proxy_stub_path: None,
            args: Vec::new(),
        }
    }
}

/// Stage durations of the shutdown escalation.
///
/// Production uses the defaults; tests compress them.
#[derive(Clone, Copy, Debug)]
pub struct ShutdownSchedule {
    /// Grace period after the polite termination request.
    pub graceful: Duration,
    /// Grace period after the hard kill.
    pub hard: Duration,
    /// Grace period after asking the container to stop.
    pub container: Duration,
}

impl Default for ShutdownSchedule {
    fn default() -> Self {
        Self {
            graceful: Duration::from_secs(10),
            hard: Duration::from_secs(4),
            container: Duration::from_secs(5),
        }
    }
}

/// Minimal view of a process container, used purely as a shutdown policy
/// knob. The container runtime itself lives elsewhere.
pub trait Container: Send + Sync {
    /// Whether the container still runs.
    fn is_running(&self) -> bool;
    /// Requests the container to stop.
    fn stop(&self);
}

// The escalation task and the owning `Process` both need the child handle:
// one to signal and reap, the other to answer `is_active`.
type SharedChild = Arc<Mutex<Option<Child>>>;

/// A launched, supervised child process.
pub struct Process {
    child: SharedChild,
    terminating: std::sync::atomic::AtomicBool,
    pid: u32,
    callsign: String,
    container: Option<Arc<dyn Container>>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("callsign", &self.callsign)
            .field("containerised", &self.container.is_some())
            .finish()
    }
}

impl Process {
    /// Launches `config.binary` pointing back at `connector`, carrying the
    /// parent's exchange id in the environment so the child can route its
    /// offer.
    #[tracing::instrument(skip_all, fields(callsign = %config.callsign))]
    pub fn launch(
        config: &ProcessConfig,
        connector: &NodeAddress,
        exchange: ExchangeId,
    ) -> Result<Self, ErrorCode> {
        let mut command = tokio::process::Command::new(config.binary.as_std_path());
        command
            .arg("--connector")
            .arg(connector.to_string())
            .arg("--class")
            .arg(&config.class_name)
            .arg("--interface")
            .arg(config.interface.0.to_string())
            .arg("--version")
            .arg(config.version.0.to_string())
            .arg("--callsign")
            .arg(&config.callsign)
            .args(&config.args)
            .env(PARENT_EXCHANGE_ID_VARIABLE, exchange.to_string())
            .kill_on_drop(false);
        if let Some(path) = &config.proxy_stub_path {
            command.arg("--proxy-stub-path").arg(path.as_str());
        }

        let child = command.spawn().map_err(|error| {
            tracing::error!(binary = %config.binary, ?error, "launching child failed");
            ErrorCode::InstantiationFailed
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "child launched");

        Ok(Self {
            child: Arc::new(Mutex::new(Some(child))),
            terminating: std::sync::atomic::AtomicBool::new(false),
            pid,
            callsign: config.callsign.clone(),
            container: None,
        })
    }

    /// Attaches a container handle, switching shutdown to the containerised
    /// escalation.
    pub fn with_container(mut self, container: Arc<dyn Container>) -> Self {
        self.container = Some(container);
        self
    }

    /// Operating-system id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Human tag for diagnostics.
    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Whether the child is still running.
    pub fn is_active(&self) -> bool {
        child_running(&self.child)
    }

    /// Starts the escalated shutdown on its own task and returns
    /// immediately; a stuck child never blocks the caller. A second call is
    /// a no-op.
    pub fn terminate(&self, schedule: ShutdownSchedule) {
        use std::sync::atomic::Ordering;

        if self.terminating.swap(true, Ordering::AcqRel) {
            return;
        }

        let closing: Box<dyn ClosingInfo> = match self.container.clone() {
            Some(container) => Box::new(ContainerClosing {
                child: self.child.clone(),
                container,
                schedule,
                callsign: self.callsign.clone(),
            }),
            None => Box::new(LocalClosing {
                child: self.child.clone(),
                schedule,
                callsign: self.callsign.clone(),
            }),
        };

        tokio::spawn(run_shutdown(closing));
    }
}

/// One shutdown strategy: performs the attempt for `iteration` and returns
/// the delay before the next one, or `None` when done.
trait ClosingInfo: Send {
    fn attempt_close(&mut self, iteration: u8) -> Option<Duration>;
}

/// Drives a [`ClosingInfo`] through its timed attempts.
async fn run_shutdown(mut closing: Box<dyn ClosingInfo>) {
    let mut iteration = 0u8;
    while let Some(delay) = closing.attempt_close(iteration) {
        tokio::time::sleep(delay).await;
        iteration += 1;
    }
}

fn child_running(child: &SharedChild) -> bool {
    let mut child = child.lock().expect("poisoned");
    match child.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
    }
}

fn send_signal(child: &SharedChild, signal: nix::sys::signal::Signal) {
    let child = child.lock().expect("poisoned");
    let Some(pid) = child.as_ref().and_then(Child::id) else {
        return;
    };
    let pid = nix::unistd::Pid::from_raw(pid as libc::pid_t);
    if let Err(error) = nix::sys::signal::kill(pid, signal) {
        tracing::debug!(%pid, ?signal, ?error, "signalling child failed");
    }
}

fn kill_now(child: &SharedChild) {
    let mut child = child.lock().expect("poisoned");
    if let Some(child) = child.as_mut()
        && let Err(error) = child.start_kill()
    {
        tracing::debug!(?error, "killing child failed");
    }
}

struct LocalClosing {
    child: SharedChild,
    schedule: ShutdownSchedule,
    callsign: String,
}

impl ClosingInfo for LocalClosing {
    fn attempt_close(&mut self, iteration: u8) -> Option<Duration> {
        if !child_running(&self.child) {
            tracing::debug!(callsign = %self.callsign, "child already gone");
            return None;
        }

        match iteration {
            0 => {
                send_signal(&self.child, nix::sys::signal::Signal::SIGTERM);
                Some(self.schedule.graceful)
            }
            1 => {
                tracing::warn!(callsign = %self.callsign, "child ignored termination, killing");
                kill_now(&self.child);
                Some(self.schedule.hard)
            }
            _ => {
                // A process that survives SIGKILL is a programmer error (or
                // a kernel in distress).
                debug_assert!(false, "child survived the kill escalation");
                tracing::error!(
                    callsign = %self.callsign,
                    code = %ErrorCode::General,
                    "child survived the kill escalation",
                );
                None
            }
        }
    }
}

struct ContainerClosing {
    child: SharedChild,
    container: Arc<dyn Container>,
    schedule: ShutdownSchedule,
    callsign: String,
}

impl ClosingInfo for ContainerClosing {
    fn attempt_close(&mut self, iteration: u8) -> Option<Duration> {
        if !child_running(&self.child) && !self.container.is_running() {
            return None;
        }

        match iteration {
            0 => {
                send_signal(&self.child, nix::sys::signal::Signal::SIGTERM);
                Some(self.schedule.graceful)
            }
            1 => {
                kill_now(&self.child);
                Some(self.schedule.hard)
            }
            2 => {
                self.container.stop();
                Some(self.schedule.container)
            }
            _ => {
                debug_assert!(false, "container survived the stop escalation");
                tracing::error!(
                    callsign = %self.callsign,
                    code = %ErrorCode::General,
                    "container survived the stop escalation",
                );
                None
            }
        }
    }
}
