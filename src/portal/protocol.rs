/// Flatpak portal method signatures, flag bits and capability checks
use crate::config::types::{CallError, CommandLine, ExternalPid, LaunchOptions, PortalInitError};
use crate::portal::message::{MessageReader, MethodCall, Value};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub const PORTAL_SERVICE_NAME: &str = "org.freedesktop.portal.Flatpak";
pub const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/Flatpak";
pub const PORTAL_INTERFACE: &str = "org.freedesktop.portal.Flatpak";

pub const METHOD_SPAWN: &str = "Spawn";
pub const METHOD_SPAWN_SIGNAL: &str = "SpawnSignal";
pub const SIGNAL_SPAWN_STARTED: &str = "SpawnStarted";
pub const SIGNAL_SPAWN_EXITED: &str = "SpawnExited";

pub const PROPERTY_VERSION: &str = "version";
pub const PROPERTY_SUPPORTS: &str = "supports";

/// Bit in the `supports` property: spawned PIDs can be exposed to the caller.
pub const SUPPORTS_EXPOSE_PIDS: u32 = 1 << 0;

/// Argument the development switch propagates to children.
pub const DISABLE_FULL_SANDBOX_ARG: &str = "--disable-full-flatpak-sandbox";

/// `flags` argument of `Spawn`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpawnFlags(u32);

impl SpawnFlags {
    pub const CLEAR_ENVIRONMENT: SpawnFlags = SpawnFlags(1 << 0);
    pub const LATEST: SpawnFlags = SpawnFlags(1 << 1);
    pub const SANDBOX: SpawnFlags = SpawnFlags(1 << 2);
    pub const NO_NETWORK: SpawnFlags = SpawnFlags(1 << 3);
    pub const WATCH_BUS: SpawnFlags = SpawnFlags(1 << 4);
    pub const EXPOSE_PIDS: SpawnFlags = SpawnFlags(1 << 5);
    pub const NOTIFY_START: SpawnFlags = SpawnFlags(1 << 6);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: SpawnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SpawnFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SpawnFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SpawnFlags {
    type Output = SpawnFlags;

    fn bitor(self, rhs: SpawnFlags) -> SpawnFlags {
        SpawnFlags(self.0 | rhs.0)
    }
}

/// `sandbox-flags` option of `Spawn`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SandboxFlags(u32);

impl SandboxFlags {
    pub const SHARE_DISPLAY: SandboxFlags = SandboxFlags(1 << 0);
    pub const SHARE_SOUND: SandboxFlags = SandboxFlags(1 << 1);
    pub const SHARE_GPU: SandboxFlags = SandboxFlags(1 << 2);
    pub const SHARE_SESSION_BUS: SandboxFlags = SandboxFlags(1 << 3);
    pub const SHARE_A11Y_BUS: SandboxFlags = SandboxFlags(1 << 4);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SandboxFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SandboxFlags {
    type Output = SandboxFlags;

    fn bitor(self, rhs: SandboxFlags) -> SandboxFlags {
        SandboxFlags(self.0 | rhs.0)
    }
}

/// Fully resolved `Spawn` request.
#[derive(Clone, Debug)]
pub struct SpawnRequest<'a> {
    pub working_dir: &'a Path,
    pub command: &'a CommandLine,
    pub options: &'a LaunchOptions,
    pub allow_extra_access: bool,
    pub disable_full_sandbox: bool,
}

impl SpawnRequest<'_> {
    pub fn spawn_flags(&self) -> SpawnFlags {
        let mut flags = SpawnFlags::SANDBOX | SpawnFlags::EXPOSE_PIDS | SpawnFlags::NOTIFY_START;
        if self.disable_full_sandbox {
            flags.remove(SpawnFlags::SANDBOX);
        }
        if self.options.clear_environment {
            flags.insert(SpawnFlags::CLEAR_ENVIRONMENT);
        }
        if self.options.kill_on_parent_death {
            flags.insert(SpawnFlags::WATCH_BUS);
        }
        flags
    }

    pub fn sandbox_flags(&self) -> SandboxFlags {
        if self.allow_extra_access {
            SandboxFlags::SHARE_DISPLAY | SandboxFlags::SHARE_GPU
        } else {
            SandboxFlags::default()
        }
    }

    /// Build `Spawn(ay cwd, aay argv, a{uh} fds, a{ss} env, u flags, a{sv} options)`.
    pub fn to_method_call(&self) -> MethodCall {
        let mut call = MethodCall::new(PORTAL_INTERFACE, METHOD_SPAWN);

        call.append(Value::Bytes(nul_terminated(self.working_dir.as_os_str())));

        let mut argv: Vec<Vec<u8>> = self
            .command
            .argv()
            .iter()
            .map(|arg| nul_terminated(arg))
            .collect();
        if self.disable_full_sandbox {
            argv.push(nul_terminated(OsStr::new(DISABLE_FULL_SANDBOX_ARG)));
        }
        call.append(Value::ByteArrays(argv));

        let mut fds = BTreeMap::new();
        for std_fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            fds.insert(std_fd as u32, std_fd);
        }
        for &(source, target) in &self.options.fds_to_remap {
            fds.insert(target, source);
        }
        call.append(Value::FdMap(fds));

        call.append(Value::StrMap(self.options.environment.clone()));
        call.append(Value::U32(self.spawn_flags().bits()));

        let mut options = BTreeMap::new();
        let sandbox_flags = self.sandbox_flags();
        if !sandbox_flags.is_empty() {
            options.insert("sandbox-flags".to_string(), Value::U32(sandbox_flags.bits()));
        }
        call.append(Value::Variants(options));

        call
    }
}

/// Build `SpawnSignal(u pid, u signal, b to_process_group)`.
pub fn spawn_signal_call(external_pid: ExternalPid, signal: i32, to_process_group: bool) -> MethodCall {
    let mut call = MethodCall::new(PORTAL_INTERFACE, METHOD_SPAWN_SIGNAL);
    call.append(Value::U32(external_pid.0))
        .append(Value::U32(signal as u32))
        .append(Value::Bool(to_process_group));
    call
}

/// Extract the external PID from a `Spawn` reply.
pub fn parse_spawn_reply(reply: &[Value]) -> Result<ExternalPid, CallError> {
    MessageReader::new(reply)
        .pop_u32()
        .map(ExternalPid)
        .ok_or_else(|| CallError::MalformedReply("Spawn() reply carries no PID".to_string()))
}

/// Capability properties read once when the bus thread starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortalCapabilities {
    pub version: u32,
    pub supports: u32,
}

impl PortalCapabilities {
    pub fn check(&self, min_version: u32) -> Result<(), PortalInitError> {
        if self.version < min_version {
            return Err(PortalInitError::VersionTooOld {
                found: self.version,
                required: min_version,
            });
        }
        if self.supports & SUPPORTS_EXPOSE_PIDS == 0 {
            return Err(PortalInitError::MissingExposePids {
                supports: self.supports,
            });
        }
        Ok(())
    }
}

fn nul_terminated(s: &OsStr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}
