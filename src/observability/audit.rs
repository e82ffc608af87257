/// Structured audit events for the portal bridge
///
/// Each event is rendered as one JSON object on the `portalbox::audit` log
/// target, tagged with the supervisor's correlation id so events from
/// several supervisors in one host process can be told apart.
use crate::config::types::ExternalPid;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "portalbox::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    PortalReady,
    PortalInitFailed,
    SpawnAccepted,
    SpawnRejected,
    SignalRequested,
    SignalRejected,
    GracefulTermination,
    ForcedKill,
    LifecycleAnomaly,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::PortalReady => AuditSeverity::Low,
            AuditEventType::PortalInitFailed => AuditSeverity::High,
            AuditEventType::SpawnAccepted => AuditSeverity::Low,
            AuditEventType::SpawnRejected => AuditSeverity::Medium,
            AuditEventType::SignalRequested => AuditSeverity::Low,
            AuditEventType::SignalRejected => AuditSeverity::Medium,
            AuditEventType::GracefulTermination => AuditSeverity::Low,
            AuditEventType::ForcedKill => AuditSeverity::Medium,
            AuditEventType::LifecycleAnomaly => AuditSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub external_pid: Option<u32>,
    pub command: Option<String>,
    pub signal: Option<i32>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details: details.into(),
            external_pid: None,
            command: None,
            signal: None,
        }
    }

    pub fn with_pid(mut self, pid: ExternalPid) -> Self {
        self.external_pid = Some(pid.0);
        self
    }

    pub fn with_command(mut self, command: String) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_signal(mut self, signal: i32) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Emits audit events for one supervisor instance
#[derive(Debug, Clone)]
pub struct AuditLog {
    supervisor_id: Uuid,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            supervisor_id: Uuid::new_v4(),
        }
    }

    pub fn supervisor_id(&self) -> Uuid {
        self.supervisor_id
    }

    /// Render an event as the JSON line written to the audit target
    pub fn render(&self, event: &AuditEvent) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": event.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            "supervisor_id": self.supervisor_id.to_string(),
            "process_id": std::process::id(),
            "event_type": event.event_type,
            "severity": event.severity,
            "details": event.details,
        });

        if let Some(pid) = event.external_pid {
            entry["external_pid"] = serde_json::json!(pid);
        }
        if let Some(command) = &event.command {
            entry["command"] = serde_json::json!(command);
        }
        if let Some(signal) = event.signal {
            entry["signal"] = serde_json::json!(signal);
        }
        entry
    }

    pub fn record(&self, event: AuditEvent) {
        let entry = self.render(&event);
        match event.severity {
            AuditSeverity::High => error!(target: AUDIT_TARGET, "{}", entry),
            AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", entry),
            AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", entry),
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
