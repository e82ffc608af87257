//! Flatpak portal protocol surface.
//!
//! The supervisor never speaks the wire format itself. It needs an object
//! proxy that can issue method calls, read properties and deliver signals;
//! [`connection::PortalConnection`] is that seam. [`protocol`] knows the
//! portal's method signatures and flag bits.

pub mod connection;
pub mod message;
pub mod protocol;

pub use connection::{PortalConnection, PortalConnector, SignalSink};
pub use message::{MessageReader, MethodCall, SignalMessage, Value};
