//! Testing infrastructure
//!
//! A scripted stand-in for the Flatpak portal, used by unit tests,
//! integration tests and the launch bench.

pub mod mock_portal;

pub use mock_portal::{MockPortal, SignalRequest};
