//! Session engine
//!
//! [`SerialEngine`] owns one device link and runs three kinds of tasks on it:
//! - a send loop that writes one queued request per tick
//! - a read loop that deframes incoming bytes, correlates them with
//!   in-flight requests and sweeps timeouts
//! - a reconnect task, only while the link is being re-established
//!
//! All user callbacks are delivered on a separate dispatcher task so the I/O
//! loops never run user code other than match rules, interceptors and the
//! framer.

mod dispatch;
pub mod listener;
pub mod supervisor;

pub use listener::{connect_listener, data_listener, ConnectListener, DataListener};
pub use supervisor::{backoff_delay, MAX_RECONNECT_DELAY};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{EngineConfig, QueueOrder};
use crate::correlation::{has_applicable_rule, CorrelationTable, Pending};
use crate::error::{Result, SerialError};
use crate::framer::Framer;
use crate::request::{Request, RequestId, Response};
use crate::transport::{is_link_fault, PortOpener, SerialPortOpener, Transport};

use dispatch::{panic_message, Event, EventReceiver, EventSender};
use listener::Listeners;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening the device
    Connecting,
    /// Connected, loops running
    Connected,
    /// Link lost, reconnect task running
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Why an I/O loop stopped
#[derive(Debug)]
enum LinkFault {
    Io(io::Error),
    Panic(String),
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFault::Io(e) => write!(f, "I/O error: {e}"),
            LinkFault::Panic(msg) => write!(f, "panic in loop tick: {msg}"),
        }
    }
}

/// The device handle, when open, plus the framer reading from it
struct Link {
    transport: Option<Box<dyn Transport>>,
    framer: Box<dyn Framer>,
}

#[derive(Default)]
struct Tasks {
    /// Lives from connect() to disconnect() or reconnect exhaustion
    session: Option<CancellationToken>,
    /// Child of `session`, cancelled to park the loops
    io: Option<CancellationToken>,
    send: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    config: EngineConfig,
    opener: Arc<dyn PortOpener>,
    state: Mutex<ConnectionState>,
    link: Mutex<Link>,
    ready: Mutex<VecDeque<Pending>>,
    table: Mutex<CorrelationTable>,
    /// Exclusive request currently holding the send loop
    blocking: Mutex<Option<RequestId>>,
    reconnecting: AtomicBool,
    tasks: Mutex<Tasks>,
    events: EventSender,
    dispatch_rx: Mutex<Option<EventReceiver>>,
    listeners: Arc<Listeners>,
}

/// Request/response client over a half-duplex serial link
///
/// # Example
///
/// ```no_run
/// use serialflow_core::prelude::*;
///
/// # async fn demo() -> anyhow::Result<()> {
/// let config = EngineConfig::builder()
///     .device_path("/dev/ttyS1")
///     .baud_rate(9600)
///     .build()?;
/// let engine = SerialEngine::new(config);
/// engine.connect().await?;
///
/// let request = Request::new(vec![0xAA, 0x55, 0x02, 0x1E, 0x1F])
///     .with_rule(rules::byte_at(3, 0x1E))
///     .with_listener(listener(
///         |resp| println!("got {}", resp.to_hex()),
///         |_req, err| eprintln!("failed: {err}"),
///     ));
/// engine.submit(request)?;
/// # Ok(())
/// # }
/// ```
pub struct SerialEngine {
    shared: Arc<Shared>,
}

impl SerialEngine {
    /// Engine backed by a real serial port
    pub fn new(config: EngineConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    /// Engine backed by a custom transport
    pub fn with_opener(config: EngineConfig, opener: Arc<dyn PortOpener>) -> Self {
        let (events, rx) = dispatch::channel();
        let framer = config.new_framer();
        Self {
            shared: Arc::new(Shared {
                config,
                opener,
                state: Mutex::new(ConnectionState::Disconnected),
                link: Mutex::new(Link {
                    transport: None,
                    framer,
                }),
                ready: Mutex::new(VecDeque::new()),
                table: Mutex::new(CorrelationTable::new()),
                blocking: Mutex::new(None),
                reconnecting: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
                events,
                dispatch_rx: Mutex::new(Some(rx)),
                listeners: Arc::new(Listeners::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Open the device and start the I/O loops
    ///
    /// No-op while already connected or reconnecting. An open failure is
    /// returned and also reported once to the connect listeners; it is not
    /// retried.
    pub async fn connect(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_dispatcher();
        {
            let mut state = shared.state.lock();
            if *state != ConnectionState::Disconnected {
                debug!(state = %*state, "connect ignored");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let path = shared.config.port().device_path.clone();
        if let Err(e) = shared.open_link() {
            *shared.state.lock() = ConnectionState::Disconnected;
            warn!(path = %path, error = %e, "connect failed");
            shared.emit(Event::Disconnected {
                path,
                error: e.clone(),
            });
            return Err(e);
        }

        {
            let mut tasks = shared.tasks.lock();
            let session = CancellationToken::new();
            // Set before the loops exist so a fault can't be overwritten
            *shared.state.lock() = ConnectionState::Connected;
            shared.spawn_loops(&mut tasks, &session);
            tasks.session = Some(session);
        }
        info!(
            path = %path,
            baud = shared.config.port().baud_rate,
            "connected"
        );
        shared.emit(Event::Connected { path });
        Ok(())
    }

    /// Stop every task, close the device and drop all queued and in-flight requests
    ///
    /// Dropped requests get no callback. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let (session, handles) = {
            let mut tasks = shared.tasks.lock();
            tasks.io = None;
            (
                tasks.session.take(),
                [tasks.reconnect.take(), tasks.send.take(), tasks.read.take()],
            )
        };
        if let Some(token) = &session {
            token.cancel();
        }
        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "engine task panicked");
                }
            }
        }

        let dropped_queue = shared.ready.lock().drain(..).count();
        let dropped_table = shared.table.lock().drain().len();
        shared.close_link();
        *shared.blocking.lock() = None;
        shared.reconnecting.store(false, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *shared.state.lock(), ConnectionState::Disconnected);
        if session.is_some() || previous != ConnectionState::Disconnected {
            info!(
                path = %shared.config.port().device_path,
                dropped_queue,
                dropped_table,
                "disconnected"
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Queue a request for sending
    ///
    /// The outgoing interceptors run here, so their errors are returned
    /// directly. Accepted only while connected or reconnecting.
    pub fn submit(&self, request: Request) -> Result<RequestId> {
        let shared = &self.shared;
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            return Err(SerialError::NotConnected);
        }

        let id = request.id();
        let mut request = shared.config.request_interceptors().run(request)?;
        request.adopt_id(id);

        if !has_applicable_rule(&request, shared.config.global_rules()) {
            debug!(request_id = %id, "rejected: no response rule");
            return Err(SerialError::NoResponseRule);
        }

        let capacity = shared.config.settings().max_queue_size;
        let mut ready = shared.ready.lock();
        if ready.len() >= capacity {
            warn!(request_id = %id, capacity, "rejected: queue full");
            return Err(SerialError::QueueFull { capacity });
        }
        debug!(
            request_id = %id,
            tag = request.tag().unwrap_or(""),
            bytes = %request.to_hex(),
            queued = ready.len() + 1,
            "request queued"
        );
        ready.push_back(Pending::new(Arc::new(request)));
        Ok(id)
    }

    /// Remove a request that has not been written yet
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut ready = self.shared.ready.lock();
        match ready.iter().position(|p| p.id() == id) {
            Some(index) => {
                ready.remove(index);
                drop(ready);
                // A cancelled resend no longer holds the link
                self.shared.release_blocking(id);
                debug!(request_id = %id, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Requests waiting to be written
    pub fn queued_len(&self) -> usize {
        self.shared.ready.lock().len()
    }

    /// Requests written and awaiting a response
    pub fn in_flight_len(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn add_connect_listener(&self, listener: Arc<dyn ConnectListener>) {
        self.shared.listeners.connect.add(listener);
    }

    pub fn remove_connect_listener(&self, listener: &Arc<dyn ConnectListener>) -> bool {
        self.shared.listeners.connect.remove(listener)
    }

    pub fn add_data_listener(&self, listener: Arc<dyn DataListener>) {
        self.shared.listeners.data.add(listener);
    }

    pub fn remove_data_listener(&self, listener: &Arc<dyn DataListener>) -> bool {
        self.shared.listeners.data.remove(listener)
    }
}

impl Drop for SerialEngine {
    fn drop(&mut self) {
        let mut tasks = self.shared.tasks.lock();
        if let Some(token) = tasks.session.take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for SerialEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialEngine")
            .field("path", &self.shared.config.port().device_path)
            .field("state", &self.state())
            .field("queued", &self.queued_len())
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

impl Shared {
    fn emit(&self, event: Event) {
        // Fails only once the dispatcher is gone, i.e. during teardown
        let _ = self.events.send(event);
    }

    fn ensure_dispatcher(&self) {
        if let Some(rx) = self.dispatch_rx.lock().take() {
            tokio::spawn(dispatch::run(rx, Arc::clone(&self.listeners)));
        }
    }

    fn notify_failure(&self, request: &Arc<Request>, error: SerialError) {
        if let Some(listener) = request.listener() {
            self.emit(Event::Failure {
                listener: Arc::clone(listener),
                request: Arc::clone(request),
                error,
            });
        }
    }

    /// Open the device and discard framer state left by the previous link
    fn open_link(&self) -> Result<()> {
        let transport = self.opener.open(self.config.port())?;
        let mut link = self.link.lock();
        link.framer.reset();
        if let Some(mut old) = link.transport.replace(transport) {
            let _ = old.close();
        }
        Ok(())
    }

    fn close_link(&self) {
        if let Some(mut transport) = self.link.lock().transport.take() {
            if let Err(e) = transport.close() {
                debug!(error = %e, "error closing transport");
            }
        }
    }

    fn spawn_loops(self: &Arc<Self>, tasks: &mut Tasks, session: &CancellationToken) {
        let io = session.child_token();
        tasks.send = Some(tokio::spawn(send_loop(Arc::clone(self), io.clone())));
        tasks.read = Some(tokio::spawn(read_loop(Arc::clone(self), io.clone())));
        tasks.io = Some(io);
    }

    /// Restart the loops after a successful reopen
    ///
    /// Returns false if the session was cancelled in the meantime.
    fn resume(self: &Arc<Self>, session: &CancellationToken) -> bool {
        let mut tasks = self.tasks.lock();
        if session.is_cancelled() {
            drop(tasks);
            self.close_link();
            self.reconnecting.store(false, Ordering::SeqCst);
            return false;
        }
        *self.state.lock() = ConnectionState::Connected;
        self.reconnecting.store(false, Ordering::SeqCst);
        self.spawn_loops(&mut tasks, session);
        drop(tasks);

        self.emit(Event::Connected {
            path: self.config.port().device_path.clone(),
        });
        true
    }

    /// Park the loops and start the reconnect task
    fn link_lost(self: &Arc<Self>, fault: LinkFault) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        let Some(session) = tasks.session.clone() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };
        if let Some(io) = tasks.io.take() {
            io.cancel();
        }
        *self.state.lock() = ConnectionState::Reconnecting;
        warn!(
            path = %self.config.port().device_path,
            reason = %fault,
            "link lost"
        );
        tasks.reconnect = Some(tokio::spawn(supervisor::run(Arc::clone(self), session)));
    }

    /// Reconnection exhausted: fail everything and end the session
    fn give_up(&self, attempts: u32) {
        let path = self.config.port().device_path.clone();
        {
            let mut tasks = self.tasks.lock();
            if let Some(session) = tasks.session.take() {
                session.cancel();
            }
            tasks.io = None;
            tasks.send = None;
            tasks.read = None;
        }

        let error = SerialError::ReconnectFailed { attempts };
        let queued: Vec<Pending> = self.ready.lock().drain(..).collect();
        let in_flight = self.table.lock().drain();
        for pending in queued.iter().chain(in_flight.iter()) {
            self.notify_failure(pending.request(), error.clone());
        }
        *self.blocking.lock() = None;
        self.close_link();
        *self.state.lock() = ConnectionState::Disconnected;
        self.reconnecting.store(false, Ordering::SeqCst);

        error!(
            path = %path,
            attempts,
            failed = queued.len() + in_flight.len(),
            "reconnect failed, giving up"
        );
        self.emit(Event::Disconnected { path, error });
    }

    fn release_blocking(&self, id: RequestId) {
        let mut blocking = self.blocking.lock();
        if *blocking == Some(id) {
            *blocking = None;
            trace!(request_id = %id, "exclusive lock released");
        }
    }

    fn pop_ready(&self) -> Option<Pending> {
        let mut ready = self.ready.lock();
        match self.config.settings().queue_order {
            QueueOrder::Lifo => ready.pop_back(),
            QueueOrder::Fifo => ready.pop_front(),
        }
    }

    /// Pull a specific request out of the ready queue
    fn take_ready(&self, id: RequestId) -> Option<Pending> {
        let mut ready = self.ready.lock();
        let index = ready.iter().position(|p| p.id() == id)?;
        ready.remove(index)
    }

    /// Put a retried request where it will be written next
    fn requeue(&self, pending: Pending) {
        let mut ready = self.ready.lock();
        match self.config.settings().queue_order {
            QueueOrder::Lifo => ready.push_back(pending),
            QueueOrder::Fifo => ready.push_front(pending),
        }
    }

    /// Write at most one queued request
    ///
    /// While an exclusive request holds the lock only its own resend may go out.
    fn send_tick(&self) -> std::result::Result<(), LinkFault> {
        let holder = *self.blocking.lock();

        let mut link = self.link.lock();
        let Some(port) = link.transport.as_mut() else {
            return Ok(());
        };
        let next = match holder {
            Some(id) => self.take_ready(id),
            None => self.pop_ready(),
        };
        let Some(mut pending) = next else {
            if let Some(id) = holder {
                trace!(request_id = %id, "send skipped: exclusive request pending");
            }
            return Ok(());
        };
        let request = Arc::clone(pending.request());
        let id = request.id();
        let retries_left = pending.retries_left();

        // Matchable before the device can possibly answer
        pending.mark_sent(Instant::now());
        if request.is_exclusive() {
            *self.blocking.lock() = Some(id);
        }
        self.table.lock().insert(pending);
        let written = port.write(request.data());
        drop(link);

        if let Err(e) = written {
            self.table.lock().remove(id);
            self.release_blocking(id);
            warn!(request_id = %id, error = %e, "write failed");
            self.notify_failure(&request, SerialError::WriteFailed(e.to_string()));
            return if is_link_fault(&e) {
                Err(LinkFault::Io(e))
            } else {
                Ok(())
            };
        }

        debug!(
            request_id = %id,
            bytes = %request.to_hex(),
            retries_left,
            "request sent"
        );
        self.emit(Event::RawRequest(request.data().to_vec()));
        Ok(())
    }

    /// Read at most one frame, correlate it, then sweep timeouts
    fn read_tick(&self) -> std::result::Result<(), LinkFault> {
        let frame = {
            let mut guard = self.link.lock();
            let Link { transport, framer } = &mut *guard;
            let Some(port) = transport.as_mut() else {
                return Ok(());
            };
            framer.next_frame(port.as_mut()).map_err(LinkFault::Io)?
        };

        let now = Instant::now();
        if let Some(frame) = frame.filter(|f| !f.is_empty()) {
            self.correlate(frame, now);
        }
        self.sweep(now);
        Ok(())
    }

    fn correlate(&self, frame: Vec<u8>, now: Instant) {
        trace!(bytes = %hex::encode_upper(&frame), "frame received");
        self.emit(Event::RawResponse(frame.clone()));

        let matched = self
            .table
            .lock()
            .find_match(&frame, now, self.config.global_rules());
        let Some(request) = matched else {
            debug!(bytes = %hex::encode_upper(&frame), "unmatched frame");
            return;
        };
        let id = request.id();

        let response = Response::new(frame, Some(Arc::clone(&request)));
        match self.config.response_interceptors().run(response) {
            Ok(response) => {
                debug!(request_id = %id, bytes = %response.to_hex(), "response matched");
                if let Some(listener) = request.listener() {
                    self.emit(Event::Response {
                        listener: Arc::clone(listener),
                        response,
                    });
                }
                self.release_blocking(id);
                if self.table.lock().record_response(id) {
                    trace!(request_id = %id, "request resolved");
                }
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "response interceptor failed");
                self.table.lock().remove(id);
                self.release_blocking(id);
                self.notify_failure(&request, e.into());
            }
        }
    }

    fn sweep(&self, now: Instant) {
        let sweep = self.table.lock().sweep(now);
        if sweep.is_empty() {
            return;
        }
        for pending in sweep.retry {
            debug!(
                request_id = %pending.id(),
                retries_left = pending.retries_left(),
                "response timeout, resending"
            );
            // An exclusive request keeps the lock through its resend
            self.requeue(pending);
        }
        for pending in sweep.expired {
            warn!(request_id = %pending.id(), "response timeout");
            self.release_blocking(pending.id());
            self.notify_failure(pending.request(), SerialError::ResponseTimeout);
        }
    }
}

/// Run one tick, turning a panic into a link fault
fn guarded<F>(tick: F) -> std::result::Result<(), LinkFault>
where
    F: FnOnce() -> std::result::Result<(), LinkFault>,
{
    match catch_unwind(AssertUnwindSafe(tick)) {
        Ok(result) => result,
        Err(panic) => Err(LinkFault::Panic(panic_message(panic.as_ref()))),
    }
}

async fn run_loop<F>(
    name: &'static str,
    shared: Arc<Shared>,
    token: CancellationToken,
    interval: Duration,
    tick: F,
) where
    F: Fn(&Shared) -> std::result::Result<(), LinkFault>,
{
    debug!(task = name, ?interval, "loop started");
    while !token.is_cancelled() {
        if let Err(fault) = guarded(|| tick(&*shared)) {
            if let LinkFault::Panic(msg) = &fault {
                error!(task = name, panic = %msg, "loop tick panicked");
            }
            shared.link_lost(fault);
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
    debug!(task = name, "loop stopped");
}

async fn send_loop(shared: Arc<Shared>, token: CancellationToken) {
    let interval = shared.config.settings().send_interval();
    run_loop("send", shared, token, interval, Shared::send_tick).await
}

async fn read_loop(shared: Arc<Shared>, token: CancellationToken) {
    let interval = shared.config.settings().read_interval();
    run_loop("read", shared, token, interval, Shared::read_tick).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::rules;
    use crate::transport::mock::MockLink;
    use pretty_assertions::assert_eq;

    fn engine(link: &MockLink) -> SerialEngine {
        let config = EngineConfig::builder()
            .device_path("/dev/ttyMOCK0")
            .baud_rate(9600)
            .max_queue_size(4)
            .build()
            .unwrap();
        SerialEngine::with_opener(config, link.opener())
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_requires_connection() {
        let link = MockLink::new();
        let engine = engine(&link);
        let err = engine
            .submit(Request::new(vec![1]).with_rule(rules::min_len(1)))
            .unwrap_err();
        assert_eq!(err, SerialError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_touches_ready_queue() {
        let link = MockLink::new();
        let engine = engine(&link);
        engine.connect().await.unwrap();

        let id = engine
            .submit(Request::new(vec![1]).with_rule(rules::min_len(1)))
            .unwrap();
        assert_eq!(engine.queued_len(), 1);
        assert!(engine.cancel(id));
        assert!(!engine.cancel(id));
        assert_eq!(engine.queued_len(), 0);

        engine.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let link = MockLink::new();
        let engine = engine(&link);
        engine.connect().await.unwrap();
        engine.connect().await.unwrap();
        assert_eq!(link.open_count(), 1);
        assert!(engine.is_connected());

        engine.disconnect().await;
        engine.disconnect().await;
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(link.close_count(), 1);
    }
}
