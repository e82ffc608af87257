//! Observability
//!
//! Structured audit events and metrics for the portal bridge.

pub mod audit;
pub mod metrics;
