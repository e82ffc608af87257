//! Portal-backed process supervision.
//!
//! The bus thread owns the portal connection; the registry is the only
//! state shared with caller threads. Launch and termination are
//! implemented as `PortalSupervisor` methods in their own modules.

pub mod bus;
pub mod dispatcher;
pub mod launcher;
pub mod registry;
pub mod supervisor;
pub mod termination;
