/// Scripted in-memory portal for exercising the supervisor without a session bus
use crate::config::types::{CallError, ExternalPid};
use crate::kernel::signal::wait_status_for_signal;
use crate::portal::connection::{PortalConnection, PortalConnector, SignalSink};
use crate::portal::message::{MessageReader, MethodCall, SignalMessage, Value};
use crate::portal::protocol::{
    METHOD_SPAWN, METHOD_SPAWN_SIGNAL, PORTAL_INTERFACE, PORTAL_OBJECT_PATH, PORTAL_SERVICE_NAME,
    PROPERTY_SUPPORTS, PROPERTY_VERSION,
    SIGNAL_SPAWN_EXITED, SIGNAL_SPAWN_STARTED, SUPPORTS_EXPOSE_PIDS,
};
use log::{debug, warn};
use nix::sys::signal::Signal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A `SpawnSignal` request as received by the mock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalRequest {
    pub pid: ExternalPid,
    pub signal: i32,
    pub to_process_group: bool,
}

#[derive(Debug)]
struct MockState {
    version: u32,
    supports: u32,
    next_pid: u32,
    connection_error: Option<String>,
    connected_to: Option<(String, String)>,
    refused_subscriptions: HashSet<String>,
    spawn_rejection: Option<(String, String)>,
    reject_signals: bool,
    /// Relative PIDs are `external + offset` when set.
    auto_start_offset: Option<u32>,
    exit_on: HashSet<i32>,
    live: HashSet<u32>,
    calls: Vec<MethodCall>,
    signal_requests: Vec<SignalRequest>,
    sinks: HashMap<String, SignalSink>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            version: 4,
            supports: SUPPORTS_EXPOSE_PIDS,
            next_pid: 100,
            connection_error: None,
            connected_to: None,
            refused_subscriptions: HashSet::new(),
            spawn_rejection: None,
            reject_signals: false,
            auto_start_offset: None,
            exit_on: HashSet::new(),
            live: HashSet::new(),
            calls: Vec::new(),
            signal_requests: Vec::new(),
            sinks: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MockState>,
    changed: Condvar,
}

/// Handle to a scripted portal.
///
/// Clones share state: keep one handle in the test and hand
/// [`MockPortal::connector`] to the supervisor.
#[derive(Clone, Debug, Default)]
pub struct MockPortal {
    shared: Arc<Shared>,
}

impl MockPortal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_version(&self, version: u32) -> &Self {
        self.state().version = version;
        self
    }

    pub fn set_supports(&self, supports: u32) -> &Self {
        self.state().supports = supports;
        self
    }

    /// External PID handed out by the next successful `Spawn`.
    pub fn set_next_pid(&self, pid: u32) -> &Self {
        self.state().next_pid = pid;
        self
    }

    pub fn fail_connection(&self, reason: &str) -> &Self {
        self.state().connection_error = Some(reason.to_string());
        self
    }

    pub fn refuse_subscription(&self, member: &str) -> &Self {
        self.state().refused_subscriptions.insert(member.to_string());
        self
    }

    /// Fail the next `Spawn` call with the given error name and message.
    pub fn reject_next_spawn(&self, name: &str, message: &str) -> &Self {
        self.state().spawn_rejection = Some((name.to_string(), message.to_string()));
        self
    }

    pub fn reject_signals(&self, reject: bool) -> &Self {
        self.state().reject_signals = reject;
        self
    }

    /// Emit `SpawnStarted(pid, pid + offset)` right after every accepted spawn.
    pub fn auto_start(&self, offset: u32) -> &Self {
        self.state().auto_start_offset = Some(offset);
        self
    }

    /// Emit `SpawnExited` for a live process when it is sent one of `signals`.
    pub fn exit_on(&self, signals: &[Signal]) -> &Self {
        self.state()
            .exit_on
            .extend(signals.iter().map(|&signal| signal as i32));
        self
    }

    /// Connector to pass to `PortalSupervisor::new`.
    pub fn connector(&self) -> impl PortalConnector {
        MockConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Service name and object path the supervisor connected to, if any.
    pub fn connected_object(&self) -> Option<(String, String)> {
        self.state().connected_to.clone()
    }

    pub fn emit_started(&self, pid: u32, relative_pid: u32) -> bool {
        self.emit(
            SIGNAL_SPAWN_STARTED,
            vec![Value::U32(pid), Value::U32(relative_pid)],
        )
    }

    pub fn emit_exited(&self, pid: u32, raw_status: u32) -> bool {
        self.state().live.remove(&pid);
        self.emit(
            SIGNAL_SPAWN_EXITED,
            vec![Value::U32(pid), Value::U32(raw_status)],
        )
    }

    /// Emit an arbitrary portal signal. Returns false if nobody is subscribed.
    pub fn emit(&self, member: &str, args: Vec<Value>) -> bool {
        let state = self.state();
        deliver(&state, member, args)
    }

    pub fn calls(&self) -> Vec<MethodCall> {
        self.state().calls.clone()
    }

    pub fn spawn_calls(&self) -> Vec<MethodCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.member == METHOD_SPAWN)
            .cloned()
            .collect()
    }

    pub fn signal_requests(&self) -> Vec<SignalRequest> {
        self.state().signal_requests.clone()
    }

    /// Block until a recorded signal request matches `predicate`.
    pub fn wait_for_signal_request(
        &self,
        predicate: impl Fn(&SignalRequest) -> bool,
        timeout: Duration,
    ) -> bool {
        let state = self.state();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| {
                !s.signal_requests.iter().any(&predicate)
            })
            .unwrap_or_else(PoisonError::into_inner);
        state.signal_requests.iter().any(predicate)
    }
}

fn deliver(state: &MockState, member: &str, args: Vec<Value>) -> bool {
    match state.sinks.get(member) {
        Some(sink) => sink.deliver(SignalMessage::new(PORTAL_INTERFACE, member, args)),
        None => {
            warn!("Mock portal has no subscriber for {}", member);
            false
        }
    }
}

struct MockConnector {
    shared: Arc<Shared>,
}

impl PortalConnector for MockConnector {
    fn connect(
        self: Box<Self>,
        service: &str,
        object_path: &str,
    ) -> Result<Box<dyn PortalConnection>, CallError> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = state.connection_error.clone() {
            return Err(CallError::Transport(reason));
        }
        if service != PORTAL_SERVICE_NAME || object_path != PORTAL_OBJECT_PATH {
            return Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.ServiceUnknown".to_string(),
                message: format!("No object {} on {}", object_path, service),
            });
        }
        state.connected_to = Some((service.to_string(), object_path.to_string()));
        drop(state);
        Ok(Box::new(MockConnection {
            shared: self.shared,
        }))
    }
}

struct MockConnection {
    shared: Arc<Shared>,
}

impl MockConnection {
    fn spawn(state: &mut MockState) -> Result<Vec<Value>, CallError> {
        if let Some((name, message)) = state.spawn_rejection.take() {
            return Err(CallError::Remote { name, message });
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.live.insert(pid);
        debug!("Mock portal spawned {}", pid);

        if let Some(offset) = state.auto_start_offset {
            deliver(
                state,
                SIGNAL_SPAWN_STARTED,
                vec![Value::U32(pid), Value::U32(pid + offset)],
            );
        }
        Ok(vec![Value::U32(pid)])
    }

    fn spawn_signal(state: &mut MockState, args: &[Value]) -> Result<Vec<Value>, CallError> {
        let mut reader = MessageReader::new(args);
        let (Some(pid), Some(signal)) = (reader.pop_u32(), reader.pop_u32()) else {
            return Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.InvalidArgs".to_string(),
                message: "expected (uub)".to_string(),
            });
        };
        let to_process_group = reader.pop_bool().unwrap_or(false);
        let signal = signal as i32;
        state.signal_requests.push(SignalRequest {
            pid: ExternalPid(pid),
            signal,
            to_process_group,
        });

        if state.reject_signals {
            return Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.UnixProcessIdUnknown".to_string(),
                message: format!("No such process {}", pid),
            });
        }

        if state.exit_on.contains(&signal) && state.live.remove(&pid) {
            if let Ok(sig) = Signal::try_from(signal) {
                deliver(
                    state,
                    SIGNAL_SPAWN_EXITED,
                    vec![Value::U32(pid), Value::U32(wait_status_for_signal(sig, false))],
                );
            }
        }
        Ok(Vec::new())
    }
}

impl PortalConnection for MockConnection {
    fn call_method(&mut self, call: &MethodCall) -> Result<Vec<Value>, CallError> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.calls.push(call.clone());

        let reply = match call.member.as_str() {
            METHOD_SPAWN => Self::spawn(&mut state),
            METHOD_SPAWN_SIGNAL => Self::spawn_signal(&mut state, &call.args),
            other => Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.UnknownMethod".to_string(),
                message: format!("No such method {}", other),
            }),
        };
        drop(state);
        self.shared.changed.notify_all();
        reply
    }

    fn get_property(&mut self, interface: &str, name: &str) -> Result<Value, CallError> {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        match (interface, name) {
            (PORTAL_INTERFACE, PROPERTY_VERSION) => Ok(Value::U32(state.version)),
            (PORTAL_INTERFACE, PROPERTY_SUPPORTS) => Ok(Value::U32(state.supports)),
            _ => Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.UnknownProperty".to_string(),
                message: format!("No such property {}", name),
            }),
        }
    }

    fn connect_to_signal(
        &mut self,
        interface: &str,
        member: &str,
        sink: SignalSink,
    ) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        if interface != PORTAL_INTERFACE || state.refused_subscriptions.contains(member) {
            return Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.AccessDenied".to_string(),
                message: format!("Subscription to {} refused", member),
            });
        }
        state.sinks.insert(member.to_string(), sink);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(mock: &MockPortal) -> Box<dyn PortalConnection> {
        Box::new(mock.connector())
            .connect(PORTAL_SERVICE_NAME, PORTAL_OBJECT_PATH)
            .unwrap()
    }

    #[test]
    fn test_spawn_assigns_sequential_pids() {
        let mock = MockPortal::new();
        mock.set_next_pid(7);
        let mut conn = connect(&mock);

        let call = MethodCall::new(PORTAL_INTERFACE, METHOD_SPAWN);
        assert_eq!(conn.call_method(&call).unwrap(), vec![Value::U32(7)]);
        assert_eq!(conn.call_method(&call).unwrap(), vec![Value::U32(8)]);
        assert_eq!(mock.spawn_calls().len(), 2);
    }

    #[test]
    fn test_rejected_spawn_is_one_shot() {
        let mock = MockPortal::new();
        mock.reject_next_spawn("org.freedesktop.DBus.Error.Failed", "no such binary");
        let mut conn = connect(&mock);

        let call = MethodCall::new(PORTAL_INTERFACE, METHOD_SPAWN);
        assert!(matches!(
            conn.call_method(&call),
            Err(CallError::Remote { .. })
        ));
        assert!(conn.call_method(&call).is_ok());
    }

    #[test]
    fn test_properties_and_refused_subscription() {
        let mock = MockPortal::new();
        mock.set_version(2).refuse_subscription(SIGNAL_SPAWN_EXITED);
        let mut conn = connect(&mock);

        assert_eq!(
            conn.get_property(PORTAL_INTERFACE, PROPERTY_VERSION).unwrap(),
            Value::U32(2)
        );
        assert!(conn.get_property(PORTAL_INTERFACE, "bogus").is_err());

        let (tx, _rx) = crossbeam_channel::unbounded();
        let sink = SignalSink::new(tx);
        assert!(conn
            .connect_to_signal(PORTAL_INTERFACE, SIGNAL_SPAWN_STARTED, sink.clone())
            .is_ok());
        assert!(conn
            .connect_to_signal(PORTAL_INTERFACE, SIGNAL_SPAWN_EXITED, sink)
            .is_err());
    }

    #[test]
    fn test_connection_failure() {
        let mock = MockPortal::new();
        mock.fail_connection("no session bus");
        assert!(Box::new(mock.connector())
            .connect(PORTAL_SERVICE_NAME, PORTAL_OBJECT_PATH)
            .is_err());
    }

    #[test]
    fn test_connect_resolves_portal_object() {
        let mock = MockPortal::new();
        assert!(Box::new(mock.connector())
            .connect("org.example.Other", PORTAL_OBJECT_PATH)
            .is_err());
        assert_eq!(mock.connected_object(), None);

        connect(&mock);
        assert_eq!(
            mock.connected_object(),
            Some((
                PORTAL_SERVICE_NAME.to_string(),
                PORTAL_OBJECT_PATH.to_string()
            ))
        );
    }

    #[test]
    fn test_emit_without_subscriber() {
        let mock = MockPortal::new();
        assert!(!mock.emit_started(1, 2));
    }
}
