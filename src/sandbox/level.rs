use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// How strictly the current process is confined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLevel {
    /// Not running inside Flatpak.
    None,
    /// Inside a regular Flatpak sandbox.
    Flatpak,
    /// Inside a nested sandbox with most permissions revoked.
    Restricted,
}

impl SandboxLevel {
    pub fn is_sandboxed(self) -> bool {
        self != SandboxLevel::None
    }
}

/// Classify the contents of a `.flatpak-info` file.
///
/// Only `sandbox=true` inside the `[Instance]` group marks a nested sandbox.
pub fn classify_flatpak_info(contents: &str) -> SandboxLevel {
    let mut in_instance = false;
    for line in contents.lines() {
        let line = line.trim_end();
        if line.starts_with('[') {
            if line == "[Instance]" {
                in_instance = true;
            } else if in_instance {
                break;
            }
        } else if in_instance && line == "sandbox=true" {
            return SandboxLevel::Restricted;
        }
    }
    SandboxLevel::Flatpak
}

/// Read the descriptor at `path` and classify it.
pub fn detect_sandbox_level(path: &Path) -> SandboxLevel {
    if !path.exists() {
        return SandboxLevel::None;
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => classify_flatpak_info(&contents),
        Err(e) => {
            // The file only exists inside a Flatpak, so its presence decides the level.
            error!("Failed to read {}: {}", path.display(), e);
            SandboxLevel::Flatpak
        }
    }
}

/// Lazily computed, cached sandbox level.
#[derive(Debug)]
pub struct SandboxLevelDetector {
    info_path: PathBuf,
    disable_full_sandbox: bool,
    level: OnceLock<SandboxLevel>,
}

impl SandboxLevelDetector {
    pub fn new(info_path: impl Into<PathBuf>, disable_full_sandbox: bool) -> Self {
        Self {
            info_path: info_path.into(),
            disable_full_sandbox,
            level: OnceLock::new(),
        }
    }

    pub fn level(&self) -> SandboxLevel {
        *self.level.get_or_init(|| {
            let mut level = detect_sandbox_level(&self.info_path);
            if level == SandboxLevel::Flatpak && self.disable_full_sandbox {
                level = SandboxLevel::Restricted;
            }
            debug!("Sandbox level from {}: {:?}", self.info_path.display(), level);
            level
        })
    }
}
