use crate::config::loader::SupervisorConfig;
use crate::config::types::{PortalInitError, Result, SupervisorError};
use crate::core::bus::BusThread;
use crate::core::dispatcher::SignalDispatcher;
use crate::core::registry::ProcessRegistry;
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::observability::metrics::{MetricsSnapshot, SupervisorMetrics};
use crate::portal::connection::PortalConnector;
use crate::portal::protocol::PortalCapabilities;
use crate::sandbox::{SandboxLevel, SandboxLevelDetector};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use uuid::Uuid;

/// Launches, signals and reaps processes through the Flatpak portal.
///
/// External PIDs are the PIDs outside the sandbox, as assigned by the
/// portal; relative PIDs are the PIDs in the current PID namespace, known
/// only once the portal emits `SpawnStarted`. One instance is normally
/// created at start-up and shared by reference.
///
/// The portal connection is made on a dedicated bus thread the first time
/// it is needed, or eagerly through [`PortalSupervisor::start`]. The outcome
/// of that first attempt is kept; a failed start is reported to every
/// later caller rather than retried.
pub struct PortalSupervisor {
    pub(crate) config: SupervisorConfig,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) metrics: Arc<SupervisorMetrics>,
    pub(crate) audit: AuditLog,
    sandbox: SandboxLevelDetector,
    connector: Mutex<Option<Box<dyn PortalConnector>>>,
    bus: OnceLock<std::result::Result<BusThread, PortalInitError>>,
}

impl PortalSupervisor {
    pub fn new(config: SupervisorConfig, connector: impl PortalConnector) -> Self {
        let sandbox =
            SandboxLevelDetector::new(&config.flatpak_info_path, config.disable_full_sandbox);
        let metrics = Arc::new(SupervisorMetrics::new());
        Self {
            config,
            registry: Arc::new(ProcessRegistry::with_metrics(Arc::clone(&metrics))),
            metrics,
            audit: AuditLog::new(),
            sandbox,
            connector: Mutex::new(Some(Box::new(connector))),
            bus: OnceLock::new(),
        }
    }

    /// Bring up the bus thread now and report whether the portal is usable.
    ///
    /// Embedders that cannot run without the portal should abort on error.
    pub fn start(&self) -> Result<PortalCapabilities> {
        Ok(self.bus()?.capabilities())
    }

    pub(crate) fn bus(&self) -> Result<&BusThread> {
        self.bus
            .get_or_init(|| self.start_bus())
            .as_ref()
            .map_err(|e| SupervisorError::Init(e.clone()))
    }

    fn start_bus(&self) -> std::result::Result<BusThread, PortalInitError> {
        let connector = self
            .connector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| PortalInitError::Connection("connector already used".to_string()))?;

        let dispatcher = SignalDispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            self.audit.clone(),
        );

        let result = BusThread::start(
            &self.config.bus_thread_name,
            connector,
            self.config.min_portal_version,
            dispatcher,
            Arc::clone(&self.metrics),
        );

        match &result {
            Ok(bus) => self.audit.record(AuditEvent::new(
                AuditEventType::PortalReady,
                format!("portal version {}", bus.capabilities().version),
            )),
            Err(e) => self
                .audit
                .record(AuditEvent::new(AuditEventType::PortalInitFailed, e.to_string())),
        }
        result
    }

    /// Wait until every event queued on the bus thread before this call has been handled.
    pub fn flush(&self) -> Result<()> {
        self.bus()?.run_blocking(|_| ())
    }

    pub fn sandbox_level(&self) -> SandboxLevel {
        self.sandbox.level()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Number of launched processes not yet reported as exited.
    pub fn tracked_count(&self) -> usize {
        self.registry.tracked_count()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn export_metrics(&self) -> String {
        self.metrics.export_prometheus()
    }

    /// Correlation id carried by this supervisor's audit events.
    pub fn supervisor_id(&self) -> Uuid {
        self.audit.supervisor_id()
    }
}

impl std::fmt::Debug for PortalSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSupervisor")
            .field("supervisor_id", &self.audit.supervisor_id())
            .field("config", &self.config)
            .field("started", &self.bus.get().map(|r| r.is_ok()))
            .finish_non_exhaustive()
    }
}
