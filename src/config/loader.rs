/// Supervisor configuration loading from a JSON file
use crate::config::types::{KillDelay, Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_KILL_DELAY_MS: &str = "PORTALBOX_KILL_DELAY_MS";
pub const ENV_DISABLE_FULL_SANDBOX: &str = "PORTALBOX_DISABLE_FULL_SANDBOX";

/// Runtime configuration for a [`crate::core::supervisor::PortalSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Name given to the background bus thread
    pub bus_thread_name: String,
    /// Grace period between SIGTERM and SIGKILL in `force_termination`
    pub default_kill_delay_ms: u64,
    /// Oldest portal interface version accepted at start-up
    pub min_portal_version: u32,
    /// Working directory used when a launch does not specify one
    pub default_working_dir: PathBuf,
    /// Descriptor file used to classify the sandbox level
    pub flatpak_info_path: PathBuf,
    /// Development switch: run children without the nested sandbox
    pub disable_full_sandbox: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bus_thread_name: "portal-bus".to_string(),
            default_kill_delay_ms: 2000,
            min_portal_version: 4,
            // /app is always present inside a Flatpak sandbox.
            default_working_dir: PathBuf::from("/app"),
            flatpak_info_path: PathBuf::from("/.flatpak-info"),
            disable_full_sandbox: false,
        }
    }
}

impl SupervisorConfig {
    /// Load and validate configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: SupervisorConfig = serde_json::from_str(content)
            .map_err(|e| SupervisorError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus_thread_name.is_empty() {
            return Err(SupervisorError::Config(
                "bus_thread_name must not be empty".to_string(),
            ));
        }
        if self.bus_thread_name.contains('\0') {
            return Err(SupervisorError::Config(
                "bus_thread_name must not contain NUL bytes".to_string(),
            ));
        }
        if self.min_portal_version == 0 {
            return Err(SupervisorError::Config(
                "min_portal_version must be at least 1".to_string(),
            ));
        }
        if !self.default_working_dir.is_absolute() {
            return Err(SupervisorError::Config(format!(
                "default_working_dir must be absolute: {}",
                self.default_working_dir.display()
            )));
        }
        Ok(())
    }

    /// Apply `PORTALBOX_*` environment overrides on top of this config
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_KILL_DELAY_MS) {
            self.default_kill_delay_ms = value.trim().parse().map_err(|_| {
                SupervisorError::Config(format!("{} is not a number: {}", ENV_KILL_DELAY_MS, value))
            })?;
        }
        if let Ok(value) = std::env::var(ENV_DISABLE_FULL_SANDBOX) {
            self.disable_full_sandbox = matches!(value.trim(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn default_kill_delay(&self) -> KillDelay {
        KillDelay::After(Duration::from_millis(self.default_kill_delay_ms))
    }
}
