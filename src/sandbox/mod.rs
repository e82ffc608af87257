//! Sandbox level detection for the current process.

pub mod level;

pub use level::{SandboxLevel, SandboxLevelDetector};
