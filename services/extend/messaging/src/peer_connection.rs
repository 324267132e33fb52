//! Connection endpoint owned by a [`Peer`].
//!
//! Frames exchanged with the far end have the layout
//!
//! ```text
//! +---------------------+----------------------------------+
//! | channel id (packed) | message (see `codec`)            |
//! +---------------------+----------------------------------+
//! ```
//!
//! Channel ids opened at the request of the far end are allocated by the
//! accepting side: positive on the acceptor, negative on the initiator.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use extend_wire::{ByteArrayWriteBuffer, DelegatingWriteBuffer, WriteBuffer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, Subject};
use crate::codec::Codec;
use crate::connection::{Connection, ConnectionManager, Receiver, Transport};
use crate::control::{messaging_factory, OpenChannelRequest, MESSAGING_VERSION};
use crate::error::ExtendError;
use crate::gate::ThreadGate;
use crate::message::Envelope;
use crate::peer::{Peer, PeerEvent};
use crate::protocol::MessageFactory;

/// Which end of the connection this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection
    Initiator,
    /// Accepted the connection
    Acceptor,
}

/// One end of a connection, multiplexing numbered channels
pub struct PeerConnection {
    id: Uuid,
    role: Role,
    me: Weak<PeerConnection>,
    peer: Weak<Peer>,
    transport: Arc<dyn Transport>,
    channels: DashMap<i32, Arc<Channel>>,
    next_channel_id: AtomicI32,
    open: AtomicBool,
    gate: ThreadGate,
    close_on_exit: AtomicBool,
    close_notify: AtomicBool,
    close_error: Mutex<Option<ExtendError>>,
    max_outgoing_message_size: usize,
}

impl PeerConnection {
    /// Create an open connection endpoint with its control channel
    pub(crate) fn new(
        id: Uuid,
        role: Role,
        peer: &Arc<Peer>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ExtendError> {
        let connection = Arc::new_cyclic(|me| Self {
            id,
            role,
            me: me.clone(),
            peer: Arc::downgrade(peer),
            transport,
            channels: DashMap::new(),
            next_channel_id: AtomicI32::new(0),
            open: AtomicBool::new(true),
            gate: ThreadGate::new(),
            close_on_exit: AtomicBool::new(false),
            close_notify: AtomicBool::new(false),
            close_error: Mutex::new(None),
            max_outgoing_message_size: peer.config().max_outgoing_message_size,
        });
        connection.create_channel(0, messaging_factory(MESSAGING_VERSION)?, None, None)?;
        Ok(connection)
    }

    /// Which end this is
    pub fn role(&self) -> Role {
        self.role
    }

    /// Identifiers of the open channels
    pub fn channel_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.channels.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn require_peer(&self) -> Result<Arc<Peer>, ExtendError> {
        self.peer
            .upgrade()
            .ok_or_else(|| ExtendError::Connection(format!("connection {} has no peer", self.id)))
    }

    fn allocate_channel_id(&self) -> i32 {
        match self.role {
            Role::Acceptor => self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1,
            Role::Initiator => self.next_channel_id.fetch_sub(1, Ordering::Relaxed) - 1,
        }
    }

    fn create_channel(
        &self,
        id: i32,
        factory: Arc<dyn MessageFactory>,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<Subject>,
    ) -> Result<Arc<Channel>, ExtendError> {
        let peer = self.require_peer()?;
        let connection: Weak<dyn Connection> = self.me.clone();
        let channel = Channel::builder(id)
            .connection(connection)
            .factory(factory)
            .serializer(peer.serializer().clone())
            .receiver(receiver)
            .subject(subject)
            .build()?;

        if self.channels.contains_key(&id) {
            return Err(ExtendError::IllegalState(format!(
                "channel {} already exists on connection {}",
                id, self.id
            )));
        }
        self.channels.insert(id, channel.clone());
        if let Err(e) = channel.open() {
            self.channels.remove(&id);
            return Err(e);
        }
        Ok(channel)
    }

    /// Ask the far end to open a channel speaking `protocol`.
    ///
    /// `remote_receiver` names the receiver registered with the far end;
    /// `receiver` handles unsolicited traffic arriving on this end.
    pub fn open_channel(
        &self,
        protocol: &str,
        remote_receiver: Option<&str>,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<Subject>,
    ) -> Result<Arc<Channel>, ExtendError> {
        let peer = self.require_peer()?;
        let factory = peer
            .protocol(protocol)
            .ok_or_else(|| ExtendError::InvalidArgument(format!("unknown protocol {protocol}")))?;
        let control = self
            .channel(0)
            .ok_or_else(|| ExtendError::Connection(format!("connection {} is closed", self.id)))?;

        let request = OpenChannelRequest::new(protocol, remote_receiver.map(str::to_owned), subject.as_ref());
        let result = control.request(Box::new(request), None)?;
        let id = result
            .as_i64()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| ExtendError::Protocol(format!("bad channel id {result}")))?;

        let channel = self.create_channel(id, factory, receiver, subject)?;
        debug!("opened {}", channel);
        Ok(channel)
    }

    /// Close the connection and every channel on it.
    ///
    /// Pending requests on every channel are cancelled with `cause`.
    pub fn close(&self, notify: bool, cause: Option<ExtendError>) {
        let timeout = match self.peer.upgrade() {
            Some(peer) if peer.is_service_thread() => Duration::ZERO,
            Some(peer) => peer.channel_close_timeout(),
            None => Duration::ZERO,
        };
        self.close_internal(notify, cause, Some(timeout));
    }

    pub(crate) fn close_internal(&self, notify: bool, cause: Option<ExtendError>, timeout: Option<Duration>) -> bool {
        if !self.is_open() {
            return false;
        }

        let mut exclusive = self.gate.close(timeout);
        if !exclusive {
            self.set_close_on_exit(notify, cause.clone());
            exclusive = self.gate.close(Some(Duration::ZERO));
        }
        if !exclusive {
            warn!("connection {} is busy; close deferred to the last thread inside", self.id);
            return false;
        }
        if !self.is_open() {
            self.gate.open();
            return false;
        }
        self.open.store(false, Ordering::Release);

        let cause = cause.unwrap_or_else(|| ExtendError::Connection(format!("connection {} closed", self.id)));
        let mut channels: Vec<Arc<Channel>> = self.channels.iter().map(|e| e.value().clone()).collect();
        // control channel last
        channels.sort_by_key(|c| c.id() == 0);
        for channel in channels {
            channel.close_internal(false, Some(cause.clone()), Some(Duration::ZERO));
        }
        self.channels.clear();
        self.gate.open();

        if notify {
            self.transport.close();
        }
        if let Some(peer) = self.peer.upgrade() {
            peer.unregister_connection(self.id);
        }
        info!("connection {} closed: {}", self.id, cause);
        true
    }

    /// Encode `message` into a frame for `channel`
    fn frame(&self, channel: &Channel, message: &Envelope) -> Result<Bytes, ExtendError> {
        let mut buffer = ByteArrayWriteBuffer::new(256);
        buffer.output().write_packed_i32(channel.id())?;
        let start = buffer.len();
        let mut window = DelegatingWriteBuffer::new(&mut buffer, start, self.max_outgoing_message_size)?;
        Codec::encode(channel, message, &mut window)?;
        Ok(buffer.freeze().to_bytes())
    }

    /// Hand an encoded frame to the transport
    pub(crate) fn transmit(&self, frame: Bytes) -> Result<(), ExtendError> {
        self.transport.send(frame)
    }
}

impl Connection for PeerConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn channel(&self, id: i32) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|c| c.value().clone())
    }

    fn manager(&self) -> Option<Arc<dyn ConnectionManager>> {
        self.peer.upgrade().map(|peer| peer as Arc<dyn ConnectionManager>)
    }

    fn post(&self, channel: &Channel, message: &Envelope) -> Result<(), ExtendError> {
        if !self.is_open() {
            return Err(ExtendError::Connection(format!("connection {} is closed", self.id)));
        }
        let frame = self.frame(channel, message)?;
        self.require_peer()?.enqueue(PeerEvent::Outbound {
            connection: self.id,
            frame,
        })
    }

    fn gate_enter(&self) -> Result<(), ExtendError> {
        let admitted = !self.is_close_on_exit() || self.gate.is_active_thread();
        let entered = admitted && self.gate.enter(Some(Duration::ZERO));
        if entered && self.is_open() {
            return Ok(());
        }
        if entered {
            self.gate.exit();
        }
        Err(ExtendError::Connection(format!("connection {} is closed", self.id)))
    }

    fn gate_exit(&self) {
        self.gate.exit();
        if self.is_close_on_exit() && !self.gate.is_active_thread() && self.gate.close(Some(Duration::ZERO)) {
            if self.is_open() {
                let notify = self.close_notify.load(Ordering::Acquire);
                let cause = self.close_error.lock().unwrap_or_else(|e| e.into_inner()).clone();
                self.close_internal(notify, cause, Some(Duration::ZERO));
            }
            self.gate.open();
        }
    }

    fn is_close_on_exit(&self) -> bool {
        self.close_on_exit.load(Ordering::Acquire)
    }

    fn set_close_on_exit(&self, notify: bool, cause: Option<ExtendError>) {
        self.close_notify.store(notify, Ordering::Release);
        *self.close_error.lock().unwrap_or_else(|e| e.into_inner()) = cause;
        self.close_on_exit.store(true, Ordering::Release);
    }

    fn unregister_channel(&self, channel: &Channel) {
        self.channels.remove(&channel.id());
    }

    fn accept_channel(
        &self,
        protocol: &str,
        receiver: Option<&str>,
        subject: Option<Subject>,
    ) -> Result<i32, ExtendError> {
        let peer = self.require_peer()?;
        let factory = peer
            .protocol(protocol)
            .ok_or_else(|| ExtendError::InvalidArgument(format!("unknown protocol {protocol}")))?;
        let receiver = receiver
            .map(|name| {
                peer.receiver(name)
                    .ok_or_else(|| ExtendError::InvalidArgument(format!("unknown receiver {name}")))
            })
            .transpose()?;

        let id = self.allocate_channel_id();
        let channel = self.create_channel(id, factory, receiver, subject)?;
        debug!("accepted {}", channel);
        Ok(id)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("open", &self.is_open())
            .field("channels", &self.channel_ids())
            .finish()
    }
}

impl fmt::Display for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connection(Id={}, Role={:?}, Open={}, Channels={})",
            self.id,
            self.role,
            self.is_open(),
            self.channels.len()
        )
    }
}

/// In-process transport delivering frames to another [`Peer`]
#[derive(Debug)]
pub struct LoopbackTransport {
    remote: Weak<Peer>,
    connection: Uuid,
}

impl LoopbackTransport {
    /// Transport to connection `connection` on `remote`
    pub fn new(remote: &Arc<Peer>, connection: Uuid) -> Self {
        Self {
            remote: Arc::downgrade(remote),
            connection,
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: Bytes) -> Result<(), ExtendError> {
        let remote = self
            .remote
            .upgrade()
            .ok_or_else(|| ExtendError::Connection("remote peer is gone".into()))?;
        remote.enqueue(PeerEvent::Inbound {
            connection: self.connection,
            frame,
        })
    }

    fn close(&self) {
        if let Some(remote) = self.remote.upgrade() {
            let cause = ExtendError::Connection(format!("connection {} closed by peer", self.connection));
            if remote
                .enqueue(PeerEvent::CloseConnection {
                    connection: self.connection,
                    notify: false,
                    cause: Some(cause),
                })
                .is_err()
            {
                debug!("remote peer already stopped; connection {} dropped", self.connection);
            }
        }
    }
}
