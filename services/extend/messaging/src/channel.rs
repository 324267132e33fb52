//! Logical channels.
//!
//! A [`Channel`] is one numbered stream multiplexed over a [`Connection`]. It
//! owns the pending-request registry and two gates: the channel gate, held
//! shared by every send and receive and exclusively by close, and the request
//! gate, which serializes request registration against the registry drain
//! performed by close. Channel 0 is reserved for control traffic.
//!
//! Gate order is always connection gate, then channel gate.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use extend_wire::{Serializer, Value};
use tracing::{debug, debug_span, error, warn};

use crate::connection::{Connection, ConnectionManager, Receiver};
use crate::control::NotifyChannelClosed;
use crate::error::ExtendError;
use crate::gate::ThreadGate;
use crate::message::{Draft, Envelope, Message, Request, Response};
use crate::protocol::MessageFactory;
use crate::status::Status;

/// Close wait used when no connection manager is reachable
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque principal a channel acts on behalf of
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject(String);

impl Subject {
    /// Wrap a principal name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Principal name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of channel counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages handed to the connection
    pub messages_sent: u64,
    /// Messages accepted by `receive`
    pub messages_received: u64,
    /// Requests registered
    pub requests_registered: u64,
    /// Responses dropped because no request was pending
    pub unsolicited_responses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    registered: AtomicU64,
    unsolicited: AtomicU64,
}

/// Builder for [`Channel`]; everything set here is immutable afterwards
#[derive(Default)]
pub struct ChannelBuilder {
    id: i32,
    connection: Option<Weak<dyn Connection>>,
    factory: Option<Arc<dyn MessageFactory>>,
    serializer: Option<Arc<dyn Serializer>>,
    receiver: Option<Arc<dyn Receiver>>,
    subject: Option<Subject>,
}

impl ChannelBuilder {
    /// Owning connection
    pub fn connection(mut self, connection: Weak<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Message factory for the negotiated protocol version
    pub fn factory(mut self, factory: Arc<dyn MessageFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Serializer for object properties
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Receiver for unsolicited messages
    pub fn receiver(mut self, receiver: Option<Arc<dyn Receiver>>) -> Self {
        self.receiver = receiver;
        self
    }

    /// Principal the channel acts for
    pub fn subject(mut self, subject: Option<Subject>) -> Self {
        self.subject = subject;
        self
    }

    /// Create the channel, still closed
    pub fn build(self) -> Result<Arc<Channel>, ExtendError> {
        let missing = |what: &str| ExtendError::InvalidArgument(format!("channel {} has no {}", self.id, what));
        let connection = self.connection.clone().ok_or_else(|| missing("connection"))?;
        let factory = self.factory.clone().ok_or_else(|| missing("message factory"))?;
        let serializer = self.serializer.clone().ok_or_else(|| missing("serializer"))?;

        Ok(Arc::new(Channel {
            id: self.id,
            connection,
            factory,
            serializer,
            receiver: self.receiver,
            subject: self.subject,
            attributes: DashMap::new(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            gate: ThreadGate::new(),
            request_gate: ThreadGate::new(),
            requests: DashMap::new(),
            next_request_id: AtomicI64::new(1),
            close_on_exit: AtomicBool::new(false),
            close_notify: AtomicBool::new(false),
            close_error: Mutex::new(None),
            counters: Counters::default(),
        }))
    }
}

/// A logical, numbered communication path over one connection
pub struct Channel {
    id: i32,
    connection: Weak<dyn Connection>,
    factory: Arc<dyn MessageFactory>,
    serializer: Arc<dyn Serializer>,
    receiver: Option<Arc<dyn Receiver>>,
    subject: Option<Subject>,
    attributes: DashMap<String, Value>,
    open: AtomicBool,
    closed: AtomicBool,
    closing: AtomicBool,
    gate: ThreadGate,
    request_gate: ThreadGate,
    requests: DashMap<i64, Arc<Status>>,
    next_request_id: AtomicI64,
    close_on_exit: AtomicBool,
    close_notify: AtomicBool,
    close_error: Mutex<Option<ExtendError>>,
    counters: Counters,
}

/// Leaves the channel gate when dropped
struct GateGuard<'a> {
    channel: &'a Arc<Channel>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.channel.gate_exit();
    }
}

impl Channel {
    /// Start building channel `id`
    pub fn builder(id: i32) -> ChannelBuilder {
        ChannelBuilder {
            id,
            ..Default::default()
        }
    }

    /// Channel identifier; 0 is the control channel
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Whether the channel is open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Owning connection, while it is alive
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.upgrade()
    }

    fn require_connection(&self) -> Result<Arc<dyn Connection>, ExtendError> {
        self.connection()
            .ok_or_else(|| ExtendError::Connection(format!("channel {} has lost its connection", self.id)))
    }

    /// Connection manager of the owning connection
    pub fn manager(&self) -> Option<Arc<dyn ConnectionManager>> {
        self.connection()?.manager()
    }

    /// Message factory
    pub fn factory(&self) -> &Arc<dyn MessageFactory> {
        &self.factory
    }

    /// Object serializer
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Receiver for unsolicited messages
    pub fn receiver(&self) -> Option<&Arc<dyn Receiver>> {
        self.receiver.as_ref()
    }

    /// Attached principal
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// Create an empty message through the channel's factory
    pub fn create(&self, type_id: i32) -> Result<Draft, ExtendError> {
        self.factory.create(type_id)
    }

    /// Attribute value
    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name).map(|v| v.value().clone())
    }

    /// Set an attribute, returning the previous value
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    /// Remove an attribute, returning its value
    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.remove(name).map(|(_, v)| v)
    }

    /// Snapshot of all attributes
    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.attributes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Pending status for request `id`
    pub fn status(&self, id: i64) -> Option<Arc<Status>> {
        self.requests.get(&id).map(|s| s.value().clone())
    }

    /// Counter snapshot
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            requests_registered: self.counters.registered.load(Ordering::Relaxed),
            unsolicited_responses: self.counters.unsolicited.load(Ordering::Relaxed),
        }
    }

    /// Open the channel. A no-op if already open; a closed channel cannot
    /// be reopened.
    pub fn open(self: &Arc<Self>) -> Result<(), ExtendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExtendError::IllegalState(format!("channel {} cannot be reopened", self.id)));
        }
        self.require_connection()?;
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Some(receiver) = &self.receiver {
            receiver.register_channel(self);
        }
        if let Some(manager) = self.manager() {
            manager.on_channel_opened(self);
        }
        debug!("opened {}", self);
        Ok(())
    }

    /// Close the channel, cancelling every pending request with `cause`.
    ///
    /// If other threads are still inside the channel when the bounded wait
    /// runs out, the close is deferred to the last of them to leave. Closing
    /// a closed channel does nothing; closing channel 0 is rejected.
    pub fn close(self: &Arc<Self>, notify: bool, cause: Option<ExtendError>) -> Result<(), ExtendError> {
        if !self.is_open() {
            return Ok(());
        }
        if self.id == 0 {
            return Err(ExtendError::Unsupported("cannot close reserved channel: 0".into()));
        }

        let timeout = match self.manager() {
            Some(manager) if manager.is_service_thread() => Duration::ZERO,
            Some(manager) => manager.channel_close_timeout(),
            None => DEFAULT_CLOSE_TIMEOUT,
        };
        self.close_internal(notify, cause, Some(timeout));
        Ok(())
    }

    /// Close without the channel 0 guard. Returns `true` if this call
    /// closed the channel, `false` if it was already closed or the close
    /// was deferred.
    pub(crate) fn close_internal(
        self: &Arc<Self>,
        notify: bool,
        cause: Option<ExtendError>,
        timeout: Option<Duration>,
    ) -> bool {
        if !self.is_open() {
            return false;
        }

        // New registrations fail from here on; the request gate is not held
        // across the channel gate wait.
        self.request_gate.close(None);
        self.closing.store(true, Ordering::Release);
        let status_error = cause
            .clone()
            .unwrap_or_else(|| ExtendError::Connection("channel closed".into()));
        let pending: Vec<i64> = self.requests.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, status)) = self.requests.remove(&id) {
                status.cancel(Some(status_error.clone()));
            }
        }
        self.request_gate.open();

        let mut exclusive = self.gate.close(timeout);
        if !exclusive {
            self.set_close_on_exit(notify, cause.clone());
            exclusive = self.gate.close(Some(Duration::ZERO));
        }

        let closing = exclusive && self.is_open();
        if closing {
            if let Some(receiver) = &self.receiver {
                receiver.unregister_channel(self);
            }
            self.open.store(false, Ordering::Release);
            self.closed.store(true, Ordering::Release);
        }
        if exclusive {
            self.gate.open();
        }

        if !closing {
            if !exclusive {
                warn!("channel {} is busy; close deferred to the last thread inside", self.id);
            }
            return false;
        }

        if let Some(receiver) = &self.receiver {
            receiver.on_channel_closed(self);
        }

        if notify && self.id != 0 {
            if let Some(channel0) = self.connection().and_then(|c| c.channel(0)) {
                let message = NotifyChannelClosed::new(self.id, cause.as_ref());
                if let Err(e) = channel0.send(Arc::new(message)) {
                    debug!("could not notify peer that channel {} closed: {}", self.id, e);
                }
            }
        }

        if let Some(connection) = self.connection() {
            connection.unregister_channel(self);
        }
        if let Some(manager) = self.manager() {
            manager.on_channel_closed(self);
        }
        debug!("closed {}", self);
        true
    }

    pub(crate) fn set_close_on_exit(&self, notify: bool, cause: Option<ExtendError>) {
        self.close_notify.store(notify, Ordering::Release);
        *self.close_error.lock().unwrap_or_else(|e| e.into_inner()) = cause;
        self.close_on_exit.store(true, Ordering::Release);
    }

    /// Whether a deferred close is pending
    pub fn is_close_on_exit(&self) -> bool {
        self.close_on_exit.load(Ordering::Acquire)
    }

    fn enter(self: &Arc<Self>) -> Result<GateGuard<'_>, ExtendError> {
        self.gate_enter()?;
        Ok(GateGuard { channel: self })
    }

    /// Enter the connection gate, then the channel gate
    pub(crate) fn gate_enter(&self) -> Result<(), ExtendError> {
        let connection = self.require_connection()?;
        connection.gate_enter()?;

        let admitted = !self.is_close_on_exit() || self.gate.is_active_thread();
        let entered = admitted && self.gate.enter(Some(Duration::ZERO));
        if entered && self.is_open() {
            return Ok(());
        }
        if entered {
            self.gate.exit();
        }
        connection.gate_exit();
        Err(ExtendError::Connection(if entered {
            format!("channel {} is closed", self.id)
        } else {
            format!("channel {} is closing", self.id)
        }))
    }

    /// Leave both gates, performing a deferred close if this was the last
    /// thread inside
    pub(crate) fn gate_exit(self: &Arc<Self>) {
        self.gate.exit();
        if let Some(connection) = self.connection() {
            connection.gate_exit();
        }

        if self.is_close_on_exit() && !self.gate.is_active_thread() && self.gate.close(Some(Duration::ZERO)) {
            if self.is_open() {
                let notify = self.close_notify.load(Ordering::Acquire);
                let cause = self.close_error.lock().unwrap_or_else(|e| e.into_inner()).clone();
                self.close_internal(notify, cause, Some(Duration::ZERO));
            }
            self.gate.open();
        }
    }

    /// Whether the current thread is inside the channel gate
    pub fn is_active_thread(&self) -> bool {
        self.gate.is_active_thread()
    }

    /// Timeout a new request gets when its caller does not specify one
    pub fn calculate_request_timeout(&self, request: &dyn Request) -> Option<Duration> {
        match self.manager() {
            Some(manager) => manager.adjust_timeout(manager.request_timeout(), request.request_timeout()),
            None => crate::message::adjust_timeout(None, request.request_timeout()),
        }
    }

    /// Assign `request` a fresh identifier and register its status.
    ///
    /// Fails if the channel is not open or a close has started.
    pub fn register_request(self: &Arc<Self>, mut request: Box<dyn Request>) -> Result<Arc<Status>, ExtendError> {
        let timeout = self.calculate_request_timeout(request.as_ref());

        self.request_gate.enter(None);
        if !self.is_open() || self.closing.load(Ordering::Acquire) {
            self.request_gate.exit();
            return Err(ExtendError::Connection(format!("channel {} is closed", self.id)));
        }
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        request.set_id(id);
        let status = Arc::new(Status::new(Arc::downgrade(self), Arc::from(request), timeout));
        self.requests.insert(id, status.clone());
        self.request_gate.exit();

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        Ok(status)
    }

    /// Remove the status of request `id` from the registry
    pub fn unregister_request(&self, id: i64) -> Option<Arc<Status>> {
        self.request_gate.enter(None);
        let removed = self.requests.remove(&id).map(|(_, status)| status);
        self.request_gate.exit();
        removed
    }

    /// Send a one-way message
    pub fn send(self: &Arc<Self>, message: Arc<dyn Message>) -> Result<(), ExtendError> {
        self.post(&Envelope::Message(message))
    }

    /// Register and send a request without waiting for its response
    pub fn send_request(self: &Arc<Self>, request: Box<dyn Request>) -> Result<Arc<Status>, ExtendError> {
        let status = self.register_request(request)?;
        self.post(&Envelope::Request(status.request().clone()))?;
        Ok(status)
    }

    /// Send a request and block for its result.
    ///
    /// A missing or zero `timeout` uses the request's default timeout.
    /// Must not be called on the service thread.
    pub fn request(self: &Arc<Self>, request: Box<dyn Request>, timeout: Option<Duration>) -> Result<Value, ExtendError> {
        if let Some(manager) = self.manager() {
            if manager.is_service_thread() {
                return Err(ExtendError::IllegalState(
                    "request() called on the service thread".into(),
                ));
            }
            manager.wait_accepting_clients()?;
        }

        let status = self.send_request(request)?;
        let timeout = match timeout {
            Some(t) if !t.is_zero() => Some(t),
            _ => status.default_timeout(),
        };
        let response = status.wait_for_response(timeout)?;
        match response.error() {
            Some(e) => Err(e),
            None => Ok(response.result().clone()),
        }
    }

    /// Hand an envelope to the connection. A failure cancels the status of
    /// a request being sent.
    fn post(self: &Arc<Self>, envelope: &Envelope) -> Result<(), ExtendError> {
        let result = self.post_gated(envelope);
        if let (Err(e), Envelope::Request(request)) = (&result, envelope) {
            if let Some(status) = self.status(request.id()) {
                status.cancel(Some(e.clone()));
            }
        }
        result
    }

    fn post_gated(self: &Arc<Self>, envelope: &Envelope) -> Result<(), ExtendError> {
        let _guard = if envelope.is_solicited() {
            if !self.gate.is_active_thread() {
                return Err(ExtendError::IllegalState(
                    "a response may only be sent while executing its request".into(),
                ));
            }
            None
        } else {
            Some(self.enter()?)
        };

        self.require_connection()?.post(self, envelope)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Dispatch an inbound message.
    ///
    /// Responses resolve or cancel their pending status; unmatched responses
    /// are counted and dropped. Requests are executed and always answered.
    /// Any other failure schedules a deferred close of the channel, or of the
    /// whole connection for channel 0.
    pub fn receive(self: &Arc<Self>, envelope: Envelope) {
        let _guard = match self.enter() {
            Ok(guard) => guard,
            Err(e) => {
                debug!("channel {} dropping message type {}: {}", self.id, envelope.type_id(), e);
                return;
            }
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.dispatch(envelope) {
            error!("error receiving on channel {}: {}", self.id, e);
            if self.id == 0 {
                if let Some(connection) = self.connection() {
                    connection.set_close_on_exit(true, Some(e));
                }
            } else {
                self.set_close_on_exit(true, Some(e));
            }
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Result<(), ExtendError> {
        match envelope {
            Envelope::Response(response) => {
                self.on_response(response);
                Ok(())
            }
            Envelope::Message(message) => self.execute(|| match &self.receiver {
                Some(receiver) => receiver.on_message(self, &message),
                None => message.run(self),
            }),
            Envelope::Request(request) => {
                let mut response = request.ensure_response(self.factory.as_ref())?;
                let outcome = self.execute(|| match &self.receiver {
                    Some(receiver) => receiver.on_request(self, &request, &mut response),
                    None => request.process(self, &mut response),
                });
                if let Err(e) = outcome {
                    let service = self.manager().map(|m| m.service_name().to_owned()).unwrap_or_default();
                    debug!(
                        "request type {} failed on channel {} for service {}: {}",
                        request.type_id(),
                        self.id,
                        service,
                        e
                    );
                    response.fail(&e);
                }
                response.set_request_id(request.id());
                self.post(&Envelope::from(response))
            }
        }
    }

    fn on_response(&self, response: Arc<Response>) {
        let Some(status) = self.status(response.request_id()) else {
            self.counters.unsolicited.fetch_add(1, Ordering::Relaxed);
            debug!(
                "channel {} ignoring unsolicited response to request {}",
                self.id,
                response.request_id()
            );
            return;
        };
        match response.error() {
            Some(e) => status.cancel(Some(e)),
            None => status.set_response(response),
        };
    }

    fn execute<F>(&self, f: F) -> Result<(), ExtendError>
    where
        F: FnOnce() -> Result<(), ExtendError>,
    {
        let span = debug_span!("execute", channel = self.id, subject = ?self.subject);
        let _entered = span.enter();
        f()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connection = self
            .connection()
            .map(|c| c.id().to_string())
            .unwrap_or_else(|| "none".into());
        write!(
            f,
            "Channel(Id={}, Open={}, Connection={}, Protocol={}, Version={})",
            self.id,
            self.is_open(),
            connection,
            self.factory.protocol().name,
            self.factory.version()
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("protocol", &self.factory.protocol().name)
            .field("pending", &self.requests.len())
            .finish()
    }
}
