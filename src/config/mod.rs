//! Configuration and shared types
//!
//! Supervisor settings, identifiers, launch options and the error taxonomy.

pub mod loader;
pub mod types;
