use crate::config::types::{
    ExternalPid, KillDelay, RelativePidLookup, Result, SandboxedProcess, SupervisorError,
    TerminationStatus,
};
use crate::core::bus::BusContext;
use crate::core::registry::Generation;
use crate::core::supervisor::PortalSupervisor;
use crate::kernel::signal::{decode_wait_status, signal_name};
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::observability::metrics::SupervisorMetrics;
use crate::portal::protocol::{spawn_signal_call, METHOD_SPAWN_SIGNAL};
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use std::sync::Arc;

/// Issue `SpawnSignal` from the bus thread, recording the outcome.
fn send_signal_on_bus(
    ctx: &mut BusContext,
    metrics: &SupervisorMetrics,
    audit: &AuditLog,
    pid: ExternalPid,
    signo: i32,
    to_process_group: bool,
) -> Result<()> {
    match ctx.call(&spawn_signal_call(pid, signo, to_process_group)) {
        Ok(_) => {
            metrics.signals_sent.inc();
            audit.record(
                AuditEvent::new(AuditEventType::SignalRequested, signal_name(signo))
                    .with_pid(pid)
                    .with_signal(signo),
            );
            Ok(())
        }
        Err(e) => {
            error!("Error calling SpawnSignal(): {}", e);
            metrics.signal_failures.inc();
            audit.record(
                AuditEvent::new(AuditEventType::SignalRejected, e.to_string())
                    .with_pid(pid)
                    .with_signal(signo),
            );
            Err(SupervisorError::Call {
                method: METHOD_SPAWN_SIGNAL,
                source: e,
            })
        }
    }
}

impl PortalSupervisor {
    /// Resolve `pid` to its PID inside the sandbox.
    ///
    /// Blocks until the portal has reported the relative PID, or until the
    /// process is known to be gone. A dead process's exit status is left in
    /// place for [`PortalSupervisor::get_termination_status`].
    pub fn get_relative_pid(&self, pid: ExternalPid) -> RelativePidLookup {
        self.registry.wait_until(|table| match table.relative_pid(pid) {
            None => {
                info!("Already died: {}", pid);
                Some(RelativePidLookup::NotFound)
            }
            Some(relative) if relative.is_known() => {
                debug!("Got {} => {}", pid, relative);
                Some(RelativePidLookup::Found(SandboxedProcess {
                    external_pid: pid,
                    relative_pid: relative,
                }))
            }
            Some(_) => {
                debug!("Waiting for {}", pid);
                None
            }
        })
    }

    /// Ask the portal to deliver signal number `signo` to `pid`.
    ///
    /// Accepts any positive number, real-time signals included. `Ok` means
    /// the portal accepted the request, not that a live process received
    /// the signal.
    pub fn signal_number(&self, pid: ExternalPid, signo: i32, to_process_group: bool) -> Result<()> {
        if signo <= 0 {
            return Err(SupervisorError::InvalidSignal(signo));
        }
        let bus = self.bus()?;
        let metrics = Arc::clone(&self.metrics);
        let audit = self.audit.clone();
        bus.run_blocking(move |ctx| {
            send_signal_on_bus(ctx, &metrics, &audit, pid, signo, to_process_group)
        })?
    }

    pub fn signal(&self, pid: ExternalPid, signal: Signal, to_process_group: bool) -> Result<()> {
        self.signal_number(pid, signal as i32, to_process_group)
    }

    /// Boolean form of [`PortalSupervisor::signal_number`].
    pub fn send_signal_number(&self, pid: ExternalPid, signo: i32, to_process_group: bool) -> bool {
        match self.signal_number(pid, signo, to_process_group) {
            Ok(()) => true,
            Err(e) => {
                debug!("{} to {} not delivered: {}", signal_name(signo), pid, e);
                false
            }
        }
    }

    pub fn send_signal(&self, pid: ExternalPid, signal: Signal, to_process_group: bool) -> bool {
        self.send_signal_number(pid, signal as i32, to_process_group)
    }

    /// Claim the exit status of `pid` without blocking.
    ///
    /// Reports [`TerminationStatus::StillRunning`] when no exit has been
    /// recorded, including for PIDs this supervisor never launched.
    pub fn get_termination_status(&self, pid: ExternalPid) -> TerminationStatus {
        let (raw, tracked) = self
            .registry
            .update(|table| (table.take_exit_status(pid), table.is_tracked(pid)));
        match raw {
            Some(raw) => decode_wait_status(raw),
            None => {
                if !tracked {
                    warn!("PID {} is not currently tracked", pid);
                    self.metrics.anomalies.inc();
                    self.audit.record(
                        AuditEvent::new(
                            AuditEventType::LifecycleAnomaly,
                            "termination status requested for untracked PID",
                        )
                        .with_pid(pid),
                    );
                }
                TerminationStatus::StillRunning
            }
        }
    }

    /// Kill `pid` and block until its exit status is available.
    ///
    /// A PID that is not tracked and has no stored status is assumed to
    /// have been collected already and reports a normal exit.
    pub fn get_known_dead_termination_status(&self, pid: ExternalPid) -> TerminationStatus {
        self.send_signal(pid, Signal::SIGKILL, false);

        let raw = self.registry.wait_until(|table| {
            if let Some(raw) = table.take_exit_status(pid) {
                return Some(raw);
            }
            if !table.is_tracked(pid) {
                warn!("PID {} is not currently tracked", pid);
                return Some(0);
            }
            None
        });
        decode_wait_status(raw)
    }

    /// Terminate `pid`, escalating from SIGTERM to SIGKILL.
    ///
    /// `None` uses the configured default delay. With
    /// [`KillDelay::Immediate`] SIGKILL is sent right away and the exit
    /// status is discarded when it arrives. Otherwise SIGTERM is sent now and
    /// SIGKILL follows on the bus thread once the delay elapses, unless the
    /// process has exited by then.
    pub fn force_termination(&self, pid: ExternalPid, kill_delay: Option<KillDelay>) {
        let kill_delay = kill_delay.unwrap_or_else(|| self.config.default_kill_delay());

        let generation = self.registry.update(|table| {
            let Some(generation) = table.generation(pid) else {
                if table.take_exit_status(pid).is_some() {
                    debug!("Collected exit status of {} without signaling", pid);
                }
                return None;
            };
            if kill_delay == KillDelay::Immediate {
                table.ignore_exit(pid);
            }
            Some(generation)
        });
        let Some(generation) = generation else {
            return;
        };

        match kill_delay {
            KillDelay::Immediate => {
                self.audit.record(
                    AuditEvent::new(AuditEventType::ForcedKill, "immediate kill")
                        .with_pid(pid)
                        .with_signal(Signal::SIGKILL as i32),
                );
                if !self.send_signal(pid, Signal::SIGKILL, false) {
                    error!("Unable to terminate process with external PID {}", pid);
                }
            }
            KillDelay::After(delay) => {
                self.audit.record(
                    AuditEvent::new(
                        AuditEventType::GracefulTermination,
                        format!("SIGKILL in {} ms", delay.as_millis()),
                    )
                    .with_pid(pid)
                    .with_signal(Signal::SIGTERM as i32),
                );
                if !self.send_signal(pid, Signal::SIGTERM, false) {
                    error!("Unable to terminate process with external PID {}", pid);
                }
                if let Err(e) = self.schedule_kill(pid, generation, delay) {
                    error!("Unable to schedule SIGKILL for {}: {}", pid, e);
                }
            }
        }
    }

    /// Send SIGKILL after `delay` unless this launch of `pid` has exited by then.
    fn schedule_kill(
        &self,
        pid: ExternalPid,
        generation: Generation,
        delay: std::time::Duration,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let metrics = Arc::clone(&self.metrics);
        let audit = self.audit.clone();

        self.bus()?.post_delayed(delay, move |ctx| {
            let escalate = registry.update(|table| {
                if table.take_exit_status_of(pid, generation).is_some()
                    || table.generation(pid) != Some(generation)
                {
                    return false;
                }
                table.ignore_exit(pid);
                true
            });
            if !escalate {
                debug!("{} exited before SIGKILL was due", pid);
                return;
            }

            info!("Escalating to SIGKILL for {}", pid);
            metrics.kill_escalations.inc();
            audit.record(
                AuditEvent::new(AuditEventType::ForcedKill, "graceful termination timed out")
                    .with_pid(pid)
                    .with_signal(Signal::SIGKILL as i32),
            );
            let kill = Signal::SIGKILL as i32;
            if send_signal_on_bus(ctx, &metrics, &audit, pid, kill, false).is_err() {
                error!("Unable to terminate process with external PID {}", pid);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::SupervisorConfig;
    use crate::config::types::{CommandLine, LaunchOptions};
    use crate::kernel::signal::wait_status_for_exit;
    use crate::testing::MockPortal;

    fn supervisor(mock: &MockPortal, kill_delay_ms: u64) -> PortalSupervisor {
        let config = SupervisorConfig {
            flatpak_info_path: "/nonexistent/.flatpak-info".into(),
            default_kill_delay_ms: kill_delay_ms,
            ..SupervisorConfig::default()
        };
        PortalSupervisor::new(config, mock.connector())
    }

    fn launch(supervisor: &PortalSupervisor) -> ExternalPid {
        supervisor
            .launch(&CommandLine::new(["/app/bin/tool"]), &LaunchOptions::default())
            .unwrap()
    }

    #[test]
    fn test_unknown_pid_resolves_to_not_found() {
        let mock = MockPortal::new();
        let supervisor = supervisor(&mock, 2000);
        assert_eq!(
            supervisor.get_relative_pid(ExternalPid(1)),
            RelativePidLookup::NotFound
        );
    }

    #[test]
    fn test_zero_relative_pid_waits_for_exit() {
        let mock = MockPortal::new();
        let supervisor = supervisor(&mock, 2000);
        let pid = launch(&supervisor);

        mock.emit_started(pid.0, 0);
        mock.emit_exited(pid.0, wait_status_for_exit(0));
        assert_eq!(supervisor.get_relative_pid(pid), RelativePidLookup::NotFound);
        supervisor.flush().unwrap();
        assert!(supervisor.get_termination_status(pid).is_normal());
    }

    #[test]
    fn test_default_delay_comes_from_config() {
        let mock = MockPortal::new();
        mock.exit_on(&[Signal::SIGKILL]);
        let supervisor = supervisor(&mock, 20);
        let pid = launch(&supervisor);

        supervisor.force_termination(pid, None);
        assert!(mock.wait_for_signal_request(
            |r| r.pid == pid && r.signal == Signal::SIGKILL as i32,
            std::time::Duration::from_secs(5),
        ));
        let signals: Vec<i32> = mock.signal_requests().iter().map(|r| r.signal).collect();
        assert_eq!(
            signals,
            vec![Signal::SIGTERM as i32, Signal::SIGKILL as i32]
        );
    }

    #[test]
    fn test_immediate_kill_marks_exit_ignored() {
        let mock = MockPortal::new();
        let supervisor = supervisor(&mock, 2000);
        let pid = launch(&supervisor);

        supervisor.force_termination(pid, Some(KillDelay::Immediate));
        assert!(supervisor.registry().inspect(|t| t.is_ignored(pid)));
        assert_eq!(supervisor.metrics().signals_sent, 1);
    }
}
