use crate::config::types::{ExternalPid, RelativePid};
use crate::core::registry::{ExitedOutcome, ProcessRegistry, StartedOutcome};
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::observability::metrics::SupervisorMetrics;
use crate::portal::message::SignalMessage;
use crate::portal::protocol::{PORTAL_INTERFACE, SIGNAL_SPAWN_EXITED, SIGNAL_SPAWN_STARTED};
use log::{debug, error, trace};
use std::sync::Arc;

/// Applies `SpawnStarted` and `SpawnExited` to the process registry.
///
/// Runs on the bus thread. It only ever signals the registry's condition
/// variable and never waits on it.
pub struct SignalDispatcher {
    registry: Arc<ProcessRegistry>,
    metrics: Arc<SupervisorMetrics>,
    audit: AuditLog,
}

impl SignalDispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        metrics: Arc<SupervisorMetrics>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            metrics,
            audit,
        }
    }

    pub fn dispatch(&self, signal: &SignalMessage) {
        if signal.interface != PORTAL_INTERFACE {
            debug!("Ignoring signal from {}", signal.interface);
            return;
        }
        match signal.member.as_str() {
            SIGNAL_SPAWN_STARTED => self.on_spawn_started(signal),
            SIGNAL_SPAWN_EXITED => self.on_spawn_exited(signal),
            other => debug!("Ignoring unexpected portal signal {}", other),
        }
    }

    fn on_spawn_started(&self, signal: &SignalMessage) {
        let mut reader = signal.reader();
        let (Some(external_pid), Some(relative_pid)) = (reader.pop_u32(), reader.pop_u32()) else {
            error!("Invalid SpawnStarted signal: {:?}", signal.args);
            return;
        };
        trace!("Received SpawnStarted: {} {}", external_pid, relative_pid);
        self.metrics.spawn_started.inc();

        let pid = ExternalPid(external_pid);
        match self.registry.record_started(pid, RelativePid(relative_pid)) {
            StartedOutcome::Resolved | StartedOutcome::NoRelativePid => {}
            StartedOutcome::Untracked => {
                self.anomaly(pid, "SpawnStarted for a process that is not tracked")
            }
            StartedOutcome::Conflict { .. } => {
                self.anomaly(pid, "SpawnStarted with a different relative PID")
            }
        }
    }

    fn on_spawn_exited(&self, signal: &SignalMessage) {
        let mut reader = signal.reader();
        let (Some(external_pid), Some(raw_status)) = (reader.pop_u32(), reader.pop_u32()) else {
            error!("Invalid SpawnExited signal: {:?}", signal.args);
            return;
        };
        trace!("Received SpawnExited: {} {}", external_pid, raw_status);
        self.metrics.spawn_exited.inc();

        let pid = ExternalPid(external_pid);
        match self.registry.record_exited(pid, raw_status) {
            ExitedOutcome::Stored => {}
            ExitedOutcome::Ignored => self.metrics.exits_ignored.inc(),
            ExitedOutcome::Untracked => {
                self.anomaly(pid, "SpawnExited for a process that is not tracked")
            }
        }
    }

    fn anomaly(&self, pid: ExternalPid, details: &str) {
        self.metrics.anomalies.inc();
        self.audit
            .record(AuditEvent::new(AuditEventType::LifecycleAnomaly, details).with_pid(pid));
    }
}
