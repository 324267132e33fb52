//! Channels, request correlation and connection management for extend.
//!
//! Many logical [`Channel`]s are multiplexed over one [`Connection`]. Each
//! channel correlates the requests it sends with the responses that come
//! back through a registry of [`Status`] handles keyed by request id, and
//! coordinates senders, receivers and closers through a [`ThreadGate`].
//!
//! ## Request Flow
//!
//! ```text
//!  caller                 Channel                  Connection / Peer
//!    │ request(req) ───▶ register Status (id = n)
//!    │                   encode + post ──────────▶ service thread ─▶ wire
//!    │ wait on Status                                 │
//!    │                   receive(Response n) ◀─────── frame decoded
//!    │ ◀─── result ───── Status resolved
//! ```
//!
//! ## Channel 0
//!
//! Every connection carries a control channel speaking
//! `MessagingProtocol`, used for the connection handshake, channel-open
//! negotiation and "channel closed" notifications. It cannot be closed on
//! its own; it goes away with its connection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod codec;
pub mod connection;
pub mod control;
pub mod error;
pub mod gate;
pub mod message;
pub mod peer;
pub mod peer_connection;
pub mod protocol;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use channel::{Channel, ChannelBuilder, ChannelStats, Subject};
pub use codec::Codec;
pub use connection::{Connection, ConnectionManager, Receiver, Transport};
pub use control::{messaging_factory, messaging_protocol, NotifyChannelClosed, OpenChannelRequest, PingRequest};
pub use error::ExtendError;
pub use gate::ThreadGate;
pub use message::{
    adjust_timeout, Draft, Envelope, Message, MessageKind, Request, RequestTimeout, Response,
    FIRST_REQUEST_PROPERTY,
};
pub use peer::{Peer, PeerConfig, PeerState, PeerStats};
pub use peer_connection::{LoopbackTransport, PeerConnection, Role};
pub use protocol::{MessageFactory, Protocol, ProtocolFactory, ProtocolFactoryBuilder};
pub use status::{Outcome, Status};
