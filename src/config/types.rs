/// Core types shared across the portalbox supervisor
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Process identifier as seen outside the sandbox, assigned by the portal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalPid(pub u32);

impl fmt::Display for ExternalPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier inside the sandbox's own PID namespace.
///
/// Zero is reserved: the portal has not reported the PID yet, or the
/// process died before it became visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePid(pub u32);

impl RelativePid {
    pub const UNKNOWN: RelativePid = RelativePid(0);

    pub fn is_known(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RelativePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a sandboxed process resolved inside the current PID namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxedProcess {
    pub external_pid: ExternalPid,
    pub relative_pid: RelativePid,
}

impl SandboxedProcess {
    pub fn pid(&self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.relative_pid.0 as i32)
    }
}

/// Outcome of resolving an external PID to its in-sandbox PID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelativePidLookup {
    Found(SandboxedProcess),
    /// The process exited (or never started) before it became visible.
    NotFound,
}

impl RelativePidLookup {
    pub fn process(self) -> Option<SandboxedProcess> {
        match self {
            RelativePidLookup::Found(process) => Some(process),
            RelativePidLookup::NotFound => None,
        }
    }
}

/// Portable classification of how a sandboxed process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationStatus {
    /// No exit has been reported for the process.
    StillRunning,
    /// Normal exit through `exit(code)`.
    Exited { code: i32 },
    /// Terminated by SIGINT, SIGTERM or SIGKILL.
    Killed { signal: i32 },
    /// Terminated by a fault signal such as SIGSEGV or SIGABRT.
    Crashed { signal: i32, core_dumped: bool },
    /// Terminated by any other signal.
    Signaled { signal: i32 },
}

impl TerminationStatus {
    /// Shell-style exit code: the exit code itself, or 128 + signal.
    pub fn exit_code(&self) -> i32 {
        match *self {
            TerminationStatus::StillRunning => 0,
            TerminationStatus::Exited { code } => code,
            TerminationStatus::Killed { signal }
            | TerminationStatus::Crashed { signal, .. }
            | TerminationStatus::Signaled { signal } => 128 + signal,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TerminationStatus::StillRunning)
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, TerminationStatus::Exited { code: 0 })
    }

    pub fn signal(&self) -> Option<i32> {
        match *self {
            TerminationStatus::Killed { signal }
            | TerminationStatus::Crashed { signal, .. }
            | TerminationStatus::Signaled { signal } => Some(signal),
            _ => None,
        }
    }
}

/// How long `force_termination` waits between SIGTERM and SIGKILL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillDelay {
    /// Skip SIGTERM and send SIGKILL right away.
    Immediate,
    /// Send SIGTERM, then SIGKILL if the process is still alive after the delay.
    After(Duration),
}

impl KillDelay {
    pub const DEFAULT: KillDelay = KillDelay::After(Duration::from_secs(2));

    pub fn from_millis(ms: u64) -> Self {
        KillDelay::After(Duration::from_millis(ms))
    }
}

impl Default for KillDelay {
    fn default() -> Self {
        KillDelay::DEFAULT
    }
}

/// Argument vector of a process to launch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandLine {
    argv: Vec<OsString>,
}

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> Option<&OsString> {
        self.argv.first()
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    /// Space-joined rendering for logs.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Launch options forwarded to the portal.
#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Working directory inside the sandbox; the configured default is used when unset.
    pub current_dir: Option<PathBuf>,
    /// Environment variables to set for the child.
    pub environment: BTreeMap<String, String>,
    /// Extra descriptors to pass, as (fd in this process, fd number in the child).
    pub fds_to_remap: Vec<(RawFd, u32)>,
    /// Start the child with an empty environment plus `environment`.
    pub clear_environment: bool,
    /// Have the portal kill the child when this process's bus connection goes away.
    pub kill_on_parent_death: bool,
}

impl LaunchOptions {
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn remap_fd(mut self, source: RawFd, target: u32) -> Self {
        self.fds_to_remap.push((source, target));
        self
    }
}

/// Failure reported by the transport or by the portal for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Reasons the portal bridge could not be brought up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortalInitError {
    #[error("Failed to connect to the session bus: {0}")]
    Connection(String),

    #[error("Failed to read portal property '{property}': {reason}")]
    PropertyUnavailable { property: String, reason: String },

    #[error("Portal version {found} is too old, version {required} or newer is required")]
    VersionTooOld { found: u32, required: u32 },

    #[error("Portal cannot expose sandbox PIDs (supports=0x{supports:x}); setuid Flatpak installations are not supported")]
    MissingExposePids { supports: u32 },

    #[error("Failed to subscribe to portal signal {signal}: {reason}")]
    SignalSubscription { signal: String, reason: String },

    #[error("Failed to start portal bus thread: {0}")]
    ThreadSpawn(String),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Portal initialization failed: {0}")]
    Init(#[from] PortalInitError),

    #[error("Portal call {method} failed: {source}")]
    Call {
        method: &'static str,
        #[source]
        source: CallError,
    },

    #[error("Portal bus thread is not running")]
    BusUnavailable,

    #[error("Invalid launch request: {0}")]
    InvalidLaunch(String),

    #[error("Invalid signal number: {0}")]
    InvalidSignal(i32),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
