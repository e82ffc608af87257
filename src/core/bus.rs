use crate::config::types::{CallError, PortalInitError, Result, SupervisorError};
use crate::core::dispatcher::SignalDispatcher;
use crate::observability::metrics::SupervisorMetrics;
use crate::portal::connection::{PortalConnection, PortalConnector, SignalSink};
use crate::portal::message::{MethodCall, SignalMessage, Value};
use crate::portal::protocol::{
    PortalCapabilities, PORTAL_INTERFACE, PORTAL_OBJECT_PATH, PORTAL_SERVICE_NAME,
    PROPERTY_SUPPORTS, PROPERTY_VERSION, SIGNAL_SPAWN_EXITED, SIGNAL_SPAWN_STARTED,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Work posted to the bus thread.
pub type BusTask = Box<dyn FnOnce(&mut BusContext) + Send>;

pub(crate) enum BusEvent {
    Task(BusTask),
    Delayed(Instant, BusTask),
    Signal(SignalMessage),
    Shutdown,
}

/// State only the bus thread may touch.
pub struct BusContext {
    connection: Box<dyn PortalConnection>,
    metrics: Arc<SupervisorMetrics>,
}

impl BusContext {
    /// Issue a portal method call from the bus thread.
    pub fn call(&mut self, call: &MethodCall) -> std::result::Result<Vec<Value>, CallError> {
        let started = Instant::now();
        let reply = self.connection.call_method(call);
        self.metrics.call_latency.observe(started.elapsed());
        reply
    }
}

struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: BusTask,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Handle to the background thread that owns the portal connection.
///
/// All portal traffic runs on this thread: posted tasks, delayed tasks and
/// inbound signals are handled one at a time in arrival order.
pub struct BusThread {
    events: Sender<BusEvent>,
    capabilities: PortalCapabilities,
}

impl BusThread {
    /// Spawn the thread and block until the portal is connected, checked and subscribed.
    pub fn start(
        name: &str,
        connector: Box<dyn PortalConnector>,
        min_version: u32,
        dispatcher: SignalDispatcher,
        metrics: Arc<SupervisorMetrics>,
    ) -> std::result::Result<Self, PortalInitError> {
        let (events_tx, events_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let sink = SignalSink::new(events_tx.clone());

        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let ctx = match initialize(connector, min_version, sink, metrics) {
                    Ok((ctx, capabilities)) => {
                        let _ = ready_tx.send(Ok(capabilities));
                        ctx
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_event_loop(ctx, events_rx, dispatcher);
            })
            .map_err(|e| PortalInitError::ThreadSpawn(e.to_string()))?;

        let capabilities = ready_rx.recv().map_err(|_| {
            PortalInitError::ThreadSpawn("bus thread exited during initialization".to_string())
        })??;

        Ok(Self {
            events: events_tx,
            capabilities,
        })
    }

    pub fn capabilities(&self) -> PortalCapabilities {
        self.capabilities
    }

    pub fn post(&self, task: impl FnOnce(&mut BusContext) + Send + 'static) -> Result<()> {
        self.events
            .send(BusEvent::Task(Box::new(task)))
            .map_err(|_| SupervisorError::BusUnavailable)
    }

    /// Run `task` on the bus thread once `delay` has elapsed.
    pub fn post_delayed(
        &self,
        delay: Duration,
        task: impl FnOnce(&mut BusContext) + Send + 'static,
    ) -> Result<()> {
        self.events
            .send(BusEvent::Delayed(Instant::now() + delay, Box::new(task)))
            .map_err(|_| SupervisorError::BusUnavailable)
    }

    /// Run `task` on the bus thread and block the caller until it returns.
    ///
    /// Must not be called from the bus thread itself.
    pub fn run_blocking<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BusContext) -> T + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        self.post(move |ctx| {
            let _ = done_tx.send(task(ctx));
        })?;
        done_rx.recv().map_err(|_| SupervisorError::BusUnavailable)
    }
}

impl Drop for BusThread {
    fn drop(&mut self) {
        let _ = self.events.send(BusEvent::Shutdown);
    }
}

fn initialize(
    connector: Box<dyn PortalConnector>,
    min_version: u32,
    sink: SignalSink,
    metrics: Arc<SupervisorMetrics>,
) -> std::result::Result<(BusContext, PortalCapabilities), PortalInitError> {
    let mut connection = connector
        .connect(PORTAL_SERVICE_NAME, PORTAL_OBJECT_PATH)
        .map_err(|e| PortalInitError::Connection(e.to_string()))?;

    let capabilities = PortalCapabilities {
        version: read_u32_property(connection.as_mut(), PROPERTY_VERSION)?,
        supports: read_u32_property(connection.as_mut(), PROPERTY_SUPPORTS)?,
    };
    capabilities.check(min_version)?;

    // Spawning without exit notifications would leak tracking state forever.
    for signal in [SIGNAL_SPAWN_STARTED, SIGNAL_SPAWN_EXITED] {
        connection
            .connect_to_signal(PORTAL_INTERFACE, signal, sink.clone())
            .map_err(|e| PortalInitError::SignalSubscription {
                signal: signal.to_string(),
                reason: e.to_string(),
            })?;
    }

    info!(
        "Portal bus ready (version {}, supports 0x{:x})",
        capabilities.version, capabilities.supports
    );
    Ok((
        BusContext {
            connection,
            metrics,
        },
        capabilities,
    ))
}

fn read_u32_property(
    connection: &mut dyn PortalConnection,
    name: &str,
) -> std::result::Result<u32, PortalInitError> {
    let unavailable = |reason: String| PortalInitError::PropertyUnavailable {
        property: name.to_string(),
        reason,
    };
    connection
        .get_property(PORTAL_INTERFACE, name)
        .map_err(|e| unavailable(e.to_string()))?
        .as_u32()
        .ok_or_else(|| unavailable("not a u32".to_string()))
}

fn run_event_loop(mut ctx: BusContext, events: Receiver<BusEvent>, dispatcher: SignalDispatcher) {
    let mut timers: BinaryHeap<Reverse<DelayedTask>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        while timers
            .peek()
            .is_some_and(|Reverse(next)| next.deadline <= Instant::now())
        {
            if let Some(Reverse(due)) = timers.pop() {
                (due.task)(&mut ctx);
            }
        }

        let event = match timers.peek() {
            Some(Reverse(next)) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match events.recv_timeout(wait) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            BusEvent::Task(task) => task(&mut ctx),
            BusEvent::Delayed(deadline, task) => {
                seq += 1;
                timers.push(Reverse(DelayedTask { deadline, seq, task }));
            }
            BusEvent::Signal(signal) => dispatcher.dispatch(&signal),
            BusEvent::Shutdown => break,
        }
    }

    if !timers.is_empty() {
        warn!("Portal bus thread stopping with {} delayed tasks pending", timers.len());
    }
    debug!("Portal bus thread exiting");
}
