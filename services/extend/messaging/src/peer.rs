//! In-process connection manager.
//!
//! A [`Peer`] owns its connections, a protocol and receiver registry, one
//! dedicated service thread and an execute pool. All frame I/O and every
//! close command funnels through the service thread's event queue:
//!
//! ```text
//!   app threads ──post──▶ ┌──────────────┐ ──frame──▶ Transport
//!                         │ service loop │
//!   Transport ──frame───▶ └──────┬───────┘
//!                                ├─ in-order messages: receive inline
//!                                └─ everything else: execute pool
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use extend_wire::{NativeSerializer, ReadBuffer, Serializer};
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::codec::Codec;
use crate::connection::{Connection, ConnectionManager, Receiver, Transport};
use crate::control::{OpenConnectionRequest, PingRequest};
use crate::error::ExtendError;
use crate::peer_connection::{LoopbackTransport, PeerConnection, Role};
use crate::protocol::MessageFactory;

/// Edition announced in the connection handshake
pub const EDITION: i32 = 1;

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Name announced to and checked by the far end
    pub service_name: String,
    /// Ceiling for request timeouts; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// How long `Channel::close` waits for threads to leave the channel
    pub channel_close_timeout: Duration,
    /// Largest encoded message this peer sends
    pub max_outgoing_message_size: usize,
    /// Largest frame this peer accepts
    pub max_incoming_message_size: usize,
    /// Execute pool size; 0 runs everything on the service thread
    pub execute_threads: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            service_name: "ExtendService".to_string(),
            request_timeout: Some(Duration::from_secs(30)),
            channel_close_timeout: Duration::from_secs(10),
            max_outgoing_message_size: 16 * 1024 * 1024,
            max_incoming_message_size: 16 * 1024 * 1024,
            execute_threads: 4,
        }
    }
}

impl PeerConfig {
    /// Set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the request timeout ceiling
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the channel close wait
    pub fn with_channel_close_timeout(mut self, timeout: Duration) -> Self {
        self.channel_close_timeout = timeout;
        self
    }

    /// Set both message size limits
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_outgoing_message_size = size;
        self.max_incoming_message_size = size;
        self
    }

    /// Set the execute pool size
    pub fn with_execute_threads(mut self, threads: usize) -> Self {
        self.execute_threads = threads;
        self
    }
}

/// Lifecycle of a [`Peer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, not yet accepting clients
    Initial,
    /// Running
    Started,
    /// Stopped for good
    Stopped,
}

/// Snapshot of peer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Frames handed to transports
    pub frames_sent: u64,
    /// Bytes handed to transports
    pub bytes_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Frames that could not be decoded
    pub decode_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    decode_failures: AtomicU64,
}

/// Work item for the service thread
#[derive(Debug)]
pub(crate) enum PeerEvent {
    /// Encoded frame to transmit
    Outbound { connection: Uuid, frame: Bytes },
    /// Frame received from the far end
    Inbound { connection: Uuid, frame: Bytes },
    /// Close a channel on the service thread
    CloseChannel {
        channel: Arc<Channel>,
        notify: bool,
        cause: Option<ExtendError>,
    },
    /// Close a connection on the service thread
    CloseConnection {
        connection: Uuid,
        notify: bool,
        cause: Option<ExtendError>,
    },
    /// Leave the service loop
    Shutdown,
}

/// Connection manager with one service thread
pub struct Peer {
    config: PeerConfig,
    me: Weak<Peer>,
    serializer: Arc<dyn Serializer>,
    protocols: DashMap<String, Arc<dyn MessageFactory>>,
    receivers: DashMap<String, Arc<dyn Receiver>>,
    connections: DashMap<Uuid, Arc<PeerConnection>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    service: Mutex<Option<JoinHandle<()>>>,
    service_thread: OnceCell<ThreadId>,
    pool: Mutex<Option<Runtime>>,
    state: Mutex<PeerState>,
    state_changed: Condvar,
    counters: Counters,
}

impl Peer {
    /// Create a peer using the native serializer
    pub fn new(config: PeerConfig) -> Arc<Self> {
        Self::with_serializer(config, Arc::new(NativeSerializer))
    }

    /// Create a peer with a specific object serializer
    pub fn with_serializer(config: PeerConfig, serializer: Arc<dyn Serializer>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            serializer,
            protocols: DashMap::new(),
            receivers: DashMap::new(),
            connections: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            service: Mutex::new(None),
            service_thread: OnceCell::new(),
            pool: Mutex::new(None),
            state: Mutex::new(PeerState::Initial),
            state_changed: Condvar::new(),
            counters: Counters::default(),
        })
    }

    /// Settings
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Serializer handed to new channels
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    fn lock_state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        *self.lock_state()
    }

    fn set_state(&self, state: PeerState) {
        *self.lock_state() = state;
        self.state_changed.notify_all();
    }

    /// Register a protocol under its name, replacing any earlier version
    pub fn register_protocol(&self, factory: Arc<dyn MessageFactory>) {
        let name = factory.protocol().name.clone();
        debug!("registered protocol {} version {}", name, factory.version());
        self.protocols.insert(name, factory);
    }

    /// Factory registered for `name`
    pub fn protocol(&self, name: &str) -> Option<Arc<dyn MessageFactory>> {
        self.protocols.get(name).map(|f| f.value().clone())
    }

    /// Register a receiver under its name
    pub fn register_receiver(&self, receiver: Arc<dyn Receiver>) {
        debug!("registered receiver {}", receiver.name());
        self.receivers.insert(receiver.name().to_owned(), receiver);
    }

    /// Receiver registered for `name`
    pub fn receiver(&self, name: &str) -> Option<Arc<dyn Receiver>> {
        self.receivers.get(name).map(|r| r.value().clone())
    }

    /// Connection `id`
    pub fn connection(&self, id: Uuid) -> Option<Arc<PeerConnection>> {
        self.connections.get(&id).map(|c| c.value().clone())
    }

    /// All open connections
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub(crate) fn unregister_connection(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    /// Counter snapshot
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Start the service thread and the execute pool
    pub fn start(&self) -> Result<(), ExtendError> {
        let mut state = self.lock_state();
        match *state {
            PeerState::Started => return Ok(()),
            PeerState::Stopped => {
                return Err(ExtendError::IllegalState(format!(
                    "service {} cannot be restarted",
                    self.config.service_name
                )))
            }
            PeerState::Initial => {}
        }

        let mut rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ExtendError::IllegalState("service loop already consumed".into()))?;

        if self.config.execute_threads > 0 {
            let pool = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(self.config.execute_threads)
                .thread_name(format!("{}-execute", self.config.service_name))
                .build()
                .map_err(|e| ExtendError::IllegalState(format!("execute pool: {e}")))?;
            *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        }

        let weak = self.me.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-service", self.config.service_name))
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    if matches!(event, PeerEvent::Shutdown) {
                        break;
                    }
                    let Some(peer) = weak.upgrade() else {
                        break;
                    };
                    peer.handle(event);
                }
                debug!("service loop exited");
            })
            .map_err(|e| ExtendError::IllegalState(format!("service thread: {e}")))?;

        let _ = self.service_thread.set(handle.thread().id());
        *self.service.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *state = PeerState::Started;
        drop(state);
        self.state_changed.notify_all();

        info!("service {} started", self.config.service_name);
        Ok(())
    }

    /// Close every connection and stop the service thread and pool
    pub fn stop(&self) {
        {
            let state = self.lock_state();
            if *state == PeerState::Stopped {
                return;
            }
        }

        let cause = ExtendError::Connection(format!("service {} stopped", self.config.service_name));
        for connection in self.connections() {
            connection.close(true, Some(cause.clone()));
        }
        self.set_state(PeerState::Stopped);

        let _ = self.events_tx.send(PeerEvent::Shutdown);
        let handle = self.service.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if !self.is_service_thread() && handle.join().is_err() {
                error!("service thread of {} panicked", self.config.service_name);
            }
        }
        if let Some(pool) = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pool.shutdown_background();
        }
        info!("service {} stopped", self.config.service_name);
    }

    pub(crate) fn enqueue(&self, event: PeerEvent) -> Result<(), ExtendError> {
        if self.state() == PeerState::Stopped && !matches!(event, PeerEvent::Shutdown) {
            return Err(ExtendError::Connection(format!(
                "service {} is stopped",
                self.config.service_name
            )));
        }
        self.events_tx
            .send(event)
            .map_err(|_| ExtendError::Connection(format!("service {} is not running", self.config.service_name)))
    }

    /// Accept a connection initiated elsewhere
    pub fn accept(self: &Arc<Self>, id: Uuid, transport: Arc<dyn Transport>) -> Result<Arc<PeerConnection>, ExtendError> {
        if self.state() != PeerState::Started {
            return Err(ExtendError::Connection(format!(
                "service {} is not accepting connections",
                self.config.service_name
            )));
        }
        let connection = PeerConnection::new(id, Role::Acceptor, self, transport)?;
        self.connections.insert(id, connection.clone());
        debug!("accepted connection {}", id);
        Ok(connection)
    }

    /// Connect to `acceptor` in-process and perform the handshake
    pub fn connect(self: &Arc<Self>, acceptor: &Arc<Peer>) -> Result<Arc<PeerConnection>, ExtendError> {
        self.wait_accepting_clients()?;
        let id = Uuid::new_v4();
        acceptor.accept(id, Arc::new(LoopbackTransport::new(self, id)))?;
        let connection = PeerConnection::new(id, Role::Initiator, self, Arc::new(LoopbackTransport::new(acceptor, id)))?;
        self.connections.insert(id, connection.clone());

        let handshake = OpenConnectionRequest::new(Some(acceptor.config.service_name.clone()), EDITION);
        let result = connection
            .channel(0)
            .ok_or_else(|| ExtendError::Connection(format!("connection {id} lost its control channel")))
            .and_then(|control| control.request(Box::new(handshake), None));
        match result {
            Ok(remote) => {
                info!("connected to {} as {}", acceptor.config.service_name, remote);
                Ok(connection)
            }
            Err(e) => {
                warn!("handshake with {} failed: {}", acceptor.config.service_name, e);
                connection.close(true, Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Round-trip a ping over the control channel of `connection`
    pub fn ping(&self, connection: &PeerConnection) -> Result<bool, ExtendError> {
        let control = connection
            .channel(0)
            .ok_or_else(|| ExtendError::Connection(format!("connection {} is closed", connection.id())))?;
        Ok(control.request(Box::<PingRequest>::default(), None)?.as_bool().unwrap_or(false))
    }

    fn handle(&self, event: PeerEvent) {
        match event {
            PeerEvent::Outbound { connection, frame } => {
                let Some(connection) = self.connection(connection) else {
                    debug!("dropping frame for closed connection {}", connection);
                    return;
                };
                let len = frame.len() as u64;
                match connection.transmit(frame) {
                    Ok(()) => {
                        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("transmit on connection {} failed: {}", connection.id(), e);
                        connection.close(false, Some(e));
                    }
                }
            }
            PeerEvent::Inbound { connection, frame } => self.on_frame(connection, frame),
            PeerEvent::CloseChannel { channel, notify, cause } => {
                if let Err(e) = channel.close(notify, cause) {
                    warn!("could not close channel {}: {}", channel.id(), e);
                }
            }
            PeerEvent::CloseConnection {
                connection,
                notify,
                cause,
            } => {
                if let Some(connection) = self.connection(connection) {
                    connection.close(notify, cause);
                }
            }
            PeerEvent::Shutdown => {}
        }
    }

    fn on_frame(&self, id: Uuid, frame: Bytes) {
        let Some(connection) = self.connection(id) else {
            debug!("dropping frame for unknown connection {}", id);
            return;
        };
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(frame.len() as u64, Ordering::Relaxed);

        if frame.len() > self.config.max_incoming_message_size {
            self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            let cause = ExtendError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                frame.len(),
                self.config.max_incoming_message_size
            ));
            error!("connection {}: {}", id, cause);
            connection.close(true, Some(cause));
            return;
        }

        let buffer = ReadBuffer::from(frame);
        let mut input = buffer.input();
        let channel_id = match input.read_packed_i32() {
            Ok(channel_id) => channel_id,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!("connection {}: unreadable frame: {}", id, e);
                connection.close(true, Some(e.into()));
                return;
            }
        };
        let Some(channel) = connection.channel(channel_id) else {
            debug!("dropping frame for closed channel {} on connection {}", channel_id, id);
            return;
        };

        let envelope = match Codec::decode(&channel, &mut input) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!("could not decode message on channel {}: {}", channel_id, e);
                if channel_id == 0 {
                    connection.close(true, Some(e));
                } else if let Err(e) = channel.close(true, Some(e)) {
                    warn!("could not close channel {}: {}", channel_id, e);
                }
                return;
            }
        };

        if envelope.execute_in_order() {
            channel.receive(envelope);
            return;
        }
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        match pool.as_ref() {
            Some(pool) => {
                pool.spawn_blocking(move || channel.receive(envelope));
            }
            None => {
                drop(pool);
                channel.receive(envelope);
            }
        }
    }
}

impl ConnectionManager for Peer {
    fn service_name(&self) -> &str {
        &self.config.service_name
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    fn channel_close_timeout(&self) -> Duration {
        self.config.channel_close_timeout
    }

    fn on_channel_opened(&self, channel: &Arc<Channel>) {
        debug!("{} opened {}", self.config.service_name, channel);
    }

    fn on_channel_closed(&self, channel: &Arc<Channel>) {
        debug!("{} closed {}", self.config.service_name, channel);
    }

    fn wait_accepting_clients(&self) -> Result<(), ExtendError> {
        let mut state = self.lock_state();
        loop {
            match *state {
                PeerState::Started => return Ok(()),
                PeerState::Stopped => {
                    return Err(ExtendError::Connection(format!(
                        "service {} is stopped",
                        self.config.service_name
                    )))
                }
                PeerState::Initial => {
                    state = self.state_changed.wait(state).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    fn close_channel(&self, channel: &Arc<Channel>, notify: bool, cause: Option<ExtendError>) {
        let event = PeerEvent::CloseChannel {
            channel: channel.clone(),
            notify,
            cause,
        };
        if let Err(e) = self.enqueue(event) {
            debug!("channel {} not closed: {}", channel.id(), e);
        }
    }

    fn is_service_thread(&self) -> bool {
        self.service_thread.get() == Some(&thread::current().id())
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            pool.shutdown_background();
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("service", &self.config.service_name)
            .field("state", &self.state())
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Protocol, ProtocolFactory};
    use crate::testing::{test_factory, CountingReceiver, EchoRequest, TEST_PROTOCOL};
    use extend_wire::Value;
    use std::time::Instant;

    fn pair(config: PeerConfig) -> (Arc<Peer>, Arc<Peer>, Arc<CountingReceiver>) {
        let receiver = Arc::new(CountingReceiver::default());
        let acceptor = Peer::new(config.clone().with_service_name("Acceptor"));
        acceptor.register_protocol(test_factory());
        acceptor.register_receiver(receiver.clone());
        acceptor.start().unwrap();

        let initiator = Peer::new(config.with_service_name("Initiator"));
        initiator.register_protocol(test_factory());
        initiator.start().unwrap();
        (acceptor, initiator, receiver)
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + Duration::from_secs(5);
        while Instant::now() < until {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_echo_round_trip() {
        let (acceptor, initiator, receiver) = pair(PeerConfig::default());
        let connection = initiator.connect(&acceptor).unwrap();
        assert!(initiator.ping(&connection).unwrap());

        let channel = connection.open_channel(TEST_PROTOCOL, Some("Echo"), None, None).unwrap();
        assert_eq!(channel.id(), 1);
        let result = channel.request(Box::new(EchoRequest::new("hello")), None).unwrap();
        assert_eq!(result.as_str(), Some("hello"));

        assert_eq!(receiver.registered.load(Ordering::SeqCst), 1);
        let remote = acceptor.connection(connection.id()).unwrap();
        assert_eq!(remote.role(), Role::Acceptor);
        assert_eq!(remote.channel_ids(), vec![0, 1]);
        assert!(initiator.stats().frames_sent >= 3);
        assert_eq!(initiator.stats().frames_sent, acceptor.stats().frames_received);

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_remote_failure_propagates() {
        let (acceptor, initiator, _) = pair(PeerConfig::default());
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, None, None, None).unwrap();

        let err = channel.request(Box::new(EchoRequest::new("fail")), None).unwrap_err();
        assert_eq!(err, ExtendError::IllegalState("boom".into()));
        assert!(channel.is_open());
        assert_eq!(channel.pending_requests(), 0);

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_unknown_protocol_or_receiver_rejected() {
        let (acceptor, initiator, _) = pair(PeerConfig::default());
        initiator.register_protocol(ProtocolFactory::builder(Protocol::new("Other", 1, 1)).response(0).build());
        let connection = initiator.connect(&acceptor).unwrap();

        let err = connection.open_channel("Nope", None, None, None).unwrap_err();
        assert!(matches!(err, ExtendError::InvalidArgument(_)));
        let err = connection.open_channel("Other", None, None, None).unwrap_err();
        assert!(matches!(err, ExtendError::InvalidArgument(_)));
        let err = connection.open_channel(TEST_PROTOCOL, Some("Missing"), None, None).unwrap_err();
        assert!(matches!(err, ExtendError::InvalidArgument(_)));
        assert_eq!(connection.channel_ids(), vec![0]);

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_concurrent_requests() {
        let (acceptor, initiator, _) = pair(PeerConfig::default());
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, None, None, None).unwrap();

        let handles: Vec<_> = (0..8i64)
            .map(|t| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for i in 0..25i64 {
                        let n = t * 100 + i;
                        let result = channel.request(Box::new(EchoRequest::new(n)), None).unwrap();
                        assert_eq!(result, Value::Int(n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(channel.stats().requests_registered, 200);

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_channel_close_reaches_peer() {
        let (acceptor, initiator, receiver) = pair(PeerConfig::default());
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, Some("Echo"), None, None).unwrap();
        let remote = acceptor.connection(connection.id()).unwrap();
        assert!(remote.channel(channel.id()).is_some());

        channel.close(true, None).unwrap();
        assert!(!channel.is_open());
        assert!(eventually(|| remote.channel(channel.id()).is_none()));
        assert_eq!(receiver.closed.load(Ordering::SeqCst), 1);

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_stop_closes_connections() {
        let (acceptor, initiator, _) = pair(PeerConfig::default());
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, None, None, None).unwrap();

        initiator.stop();
        assert_eq!(initiator.state(), PeerState::Stopped);
        assert!(!connection.is_open());
        assert!(!channel.is_open());
        assert!(initiator.wait_accepting_clients().is_err());
        assert!(eventually(|| acceptor.connections().is_empty()));

        let err = channel.request(Box::new(EchoRequest::new("late")), None).unwrap_err();
        assert!(err.is_connection());
        assert!(initiator.start().is_err());

        acceptor.stop();
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (acceptor, initiator, _) = pair(PeerConfig::default().with_max_message_size(128));
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, None, None, None).unwrap();

        let err = channel
            .request(Box::new(EchoRequest::new("x".repeat(512))), None)
            .unwrap_err();
        assert!(matches!(err, ExtendError::Bounds(_)));
        assert_eq!(channel.pending_requests(), 0);
        assert!(channel.is_open());

        let result = channel.request(Box::new(EchoRequest::new("small")), None).unwrap();
        assert_eq!(result.as_str(), Some("small"));

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_service_thread_only_when_pool_disabled() {
        let (acceptor, initiator, _) = pair(PeerConfig::default().with_execute_threads(0));
        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection.open_channel(TEST_PROTOCOL, None, None, None).unwrap();
        let result = channel.request(Box::new(EchoRequest::new(7i64)), None).unwrap();
        assert_eq!(result.as_i64(), Some(7));
        assert!(!acceptor.is_service_thread());

        initiator.stop();
        acceptor.stop();
    }

    #[test]
    fn test_connect_requires_started_acceptor() {
        let acceptor = Peer::new(PeerConfig::default());
        let initiator = Peer::new(PeerConfig::default());
        initiator.start().unwrap();

        let err = initiator.connect(&acceptor).unwrap_err();
        assert!(err.is_connection());
        assert!(initiator.connections().is_empty());

        initiator.stop();
    }
}
