use crate::config::types::{
    CallError, CommandLine, ExternalPid, LaunchOptions, Result, SupervisorError,
};
use crate::core::supervisor::PortalSupervisor;
use crate::observability::audit::{AuditEvent, AuditEventType};
use crate::portal::protocol::{parse_spawn_reply, SpawnRequest, METHOD_SPAWN};
use crate::sandbox::SandboxLevel;
use log::{debug, error, warn};
use std::sync::Arc;

impl PortalSupervisor {
    /// Launch `command` inside a new Flatpak sandbox.
    ///
    /// Blocks until the portal has accepted or rejected the request, not
    /// until the process runs. The returned PID is external; the process
    /// may already have exited by the time the caller looks at it. Use
    /// [`PortalSupervisor::get_relative_pid`] to resolve it.
    pub fn launch(&self, command: &CommandLine, options: &LaunchOptions) -> Result<ExternalPid> {
        self.launch_with_access(command, options, false)
    }

    /// Like [`PortalSupervisor::launch`]; `allow_extra_access` additionally
    /// shares the host display and GPU with the child.
    pub fn launch_with_access(
        &self,
        command: &CommandLine,
        options: &LaunchOptions,
        allow_extra_access: bool,
    ) -> Result<ExternalPid> {
        if command.is_empty() {
            return Err(SupervisorError::InvalidLaunch("empty command".to_string()));
        }
        if self.sandbox_level() == SandboxLevel::None {
            warn!("Launching through the Flatpak portal outside of a Flatpak sandbox");
        }

        let bus = self.bus()?;
        debug!("Running via Flatpak: {}", command.display());

        let working_dir = options
            .current_dir
            .clone()
            .unwrap_or_else(|| self.config.default_working_dir.clone());
        let disable_full_sandbox = self.config.disable_full_sandbox;
        let registry = Arc::clone(&self.registry);
        let task_command = command.clone();
        let task_options = options.clone();

        let reply = bus.run_blocking(move |ctx| {
            let request = SpawnRequest {
                working_dir: &working_dir,
                command: &task_command,
                options: &task_options,
                allow_extra_access,
                disable_full_sandbox,
            };
            let pid = ctx
                .call(&request.to_method_call())
                .and_then(|reply| parse_spawn_reply(&reply))?;
            // Recorded before any later signal for this PID is dispatched.
            registry.record_spawned(pid);
            Ok::<ExternalPid, CallError>(pid)
        })?;

        match reply {
            Ok(pid) => {
                debug!("Spawn() returned PID {}", pid);
                self.metrics.launches.inc();
                self.audit.record(
                    AuditEvent::new(AuditEventType::SpawnAccepted, "spawn accepted")
                        .with_pid(pid)
                        .with_command(command.display()),
                );
                Ok(pid)
            }
            Err(e) => {
                error!("Error calling Spawn(): {}", e);
                self.metrics.launch_failures.inc();
                self.audit.record(
                    AuditEvent::new(AuditEventType::SpawnRejected, e.to_string())
                        .with_command(command.display()),
                );
                Err(SupervisorError::Call {
                    method: METHOD_SPAWN,
                    source: e,
                })
            }
        }
    }
}
