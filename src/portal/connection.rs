use crate::config::types::CallError;
use crate::core::bus::BusEvent;
use crate::portal::message::{MethodCall, SignalMessage, Value};
use crossbeam_channel::Sender;

/// Object proxy for the portal, owned and used exclusively by the bus thread.
///
/// Implementations wrap a real session-bus connection or, in tests, the
/// scripted [`crate::testing::mock_portal::MockPortal`].
pub trait PortalConnection: Send {
    /// Issue a method call and wait for its reply.
    fn call_method(&mut self, call: &MethodCall) -> Result<Vec<Value>, CallError>;

    /// Read a property of the portal object.
    fn get_property(&mut self, interface: &str, name: &str) -> Result<Value, CallError>;

    /// Subscribe to a signal. `Ok` means the subscription is confirmed and
    /// every later emission is passed to `sink`.
    fn connect_to_signal(
        &mut self,
        interface: &str,
        member: &str,
        sink: SignalSink,
    ) -> Result<(), CallError>;
}

/// Acquires the portal connection. Invoked once, on the bus thread.
pub trait PortalConnector: Send + 'static {
    /// Connect to the session bus and resolve the object at `object_path`
    /// owned by the well-known name `service`.
    fn connect(
        self: Box<Self>,
        service: &str,
        object_path: &str,
    ) -> Result<Box<dyn PortalConnection>, CallError>;
}

impl<F> PortalConnector for F
where
    F: FnOnce(&str, &str) -> Result<Box<dyn PortalConnection>, CallError> + Send + 'static,
{
    fn connect(
        self: Box<Self>,
        service: &str,
        object_path: &str,
    ) -> Result<Box<dyn PortalConnection>, CallError> {
        (*self)(service, object_path)
    }
}

/// Delivers inbound signals onto the bus thread's event queue.
///
/// Signals share the queue with posted tasks, so they are handled in the
/// order they arrive relative to work posted by callers.
#[derive(Clone)]
pub struct SignalSink {
    tx: Sender<BusEvent>,
}

impl SignalSink {
    pub(crate) fn new(tx: Sender<BusEvent>) -> Self {
        Self { tx }
    }

    /// Queue a signal for dispatch. Returns false once the bus thread is gone.
    pub fn deliver(&self, signal: SignalMessage) -> bool {
        self.tx.send(BusEvent::Signal(signal)).is_ok()
    }
}

impl std::fmt::Debug for SignalSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSink").finish_non_exhaustive()
    }
}
