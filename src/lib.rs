//! portalbox: process supervision through the Flatpak sandbox portal
//!
//! A process running inside Flatpak cannot create sandboxed children
//! itself; it asks the portal to spawn them. The portal hands back PIDs
//! from outside the sandbox and reports starts and exits as bus signals.
//! This crate turns that asynchronous protocol into a blocking API.
//!
//! # Architecture
//!
//! ## Supervision core ([`core`])
//! - [`core::supervisor`]: The injectable [`PortalSupervisor`] and its lazy bus start
//! - [`core::registry`]: Tracked / exited / ignored process bookkeeping behind one mutex
//! - [`core::bus`]: The thread that owns the portal connection
//! - [`core::dispatcher`]: `SpawnStarted` / `SpawnExited` handling
//! - [`core::launcher`]: `Spawn` requests
//! - [`core::termination`]: Signals, exit status retrieval and kill escalation
//!
//! ## Portal protocol ([`portal`])
//! - [`portal::protocol`]: Method, signal and flag constants; request encoding
//! - [`portal::message`]: Bus argument values
//! - [`portal::connection`]: The transport seam implemented by bus bindings
//!
//! ## Kernel helpers ([`kernel`])
//! - [`kernel::signal`]: Wait status decoding
//!
//! ## Sandbox detection ([`sandbox`])
//! - [`sandbox::level`]: `.flatpak-info` classification
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Counters and Prometheus text export
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: JSON configuration with environment overrides
//! - [`config::types`]: Shared types and error enums
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::mock_portal`]: Scripted in-memory portal

// Supervision core
pub mod core;

// Portal protocol and transport seam
pub mod portal;

// Kernel helpers
pub mod kernel;

// Sandbox detection
pub mod sandbox;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint for the portalbox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::loader::SupervisorConfig;
pub use config::types::*;
pub use core::supervisor::PortalSupervisor;
pub use portal::connection::{PortalConnection, PortalConnector, SignalSink};
pub use sandbox::SandboxLevel;
