//! Collaborators a channel depends on.
//!
//! A [`Connection`] owns its channels and the physical transport; a
//! [`ConnectionManager`] owns connections and the service thread; a
//! [`Receiver`] handles unsolicited traffic for the channels it is attached
//! to.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::channel::{Channel, Subject};
use crate::error::ExtendError;
use crate::message::{adjust_timeout, Envelope, Message, Request, RequestTimeout, Response};

/// A physical connection multiplexing numbered channels
pub trait Connection: Send + Sync + fmt::Debug {
    /// Connection identifier
    fn id(&self) -> Uuid;

    /// Whether the connection is open
    fn is_open(&self) -> bool;

    /// Open channel with the given id
    fn channel(&self, id: i32) -> Option<Arc<Channel>>;

    /// Owning connection manager, while it is alive
    fn manager(&self) -> Option<Arc<dyn ConnectionManager>>;

    /// Encode `message` for `channel` and queue it for transmission
    fn post(&self, channel: &Channel, message: &Envelope) -> Result<(), ExtendError>;

    /// Enter the connection gate
    fn gate_enter(&self) -> Result<(), ExtendError>;

    /// Leave the connection gate; may perform a deferred close
    fn gate_exit(&self);

    /// Whether a deferred close is pending
    fn is_close_on_exit(&self) -> bool;

    /// Request a deferred close performed by the last thread to leave the gate
    fn set_close_on_exit(&self, notify: bool, cause: Option<ExtendError>);

    /// Forget a closed channel
    fn unregister_channel(&self, channel: &Channel);

    /// Create and open a channel at the request of the peer, returning its id
    fn accept_channel(
        &self,
        protocol: &str,
        receiver: Option<&str>,
        subject: Option<Subject>,
    ) -> Result<i32, ExtendError>;
}

/// Owner of connections and the single service thread
pub trait ConnectionManager: Send + Sync + fmt::Debug {
    /// Service name, used in logs and the connection handshake
    fn service_name(&self) -> &str;

    /// Default request timeout; `None` is infinite
    fn request_timeout(&self) -> Option<Duration>;

    /// Combine a timeout ceiling with a per-request override
    fn adjust_timeout(&self, base: Option<Duration>, requested: RequestTimeout) -> Option<Duration> {
        adjust_timeout(base, requested)
    }

    /// Longest a caller waits to close a channel before deferring the close
    fn channel_close_timeout(&self) -> Duration;

    /// Called once a channel is open
    fn on_channel_opened(&self, channel: &Arc<Channel>);

    /// Called once a channel is closed
    fn on_channel_closed(&self, channel: &Arc<Channel>);

    /// Block until the manager accepts traffic; fails once it has stopped
    fn wait_accepting_clients(&self) -> Result<(), ExtendError>;

    /// Close `channel` on the service thread
    fn close_channel(&self, channel: &Arc<Channel>, notify: bool, cause: Option<ExtendError>);

    /// Whether the current thread is the service thread
    fn is_service_thread(&self) -> bool;
}

/// Handler for unsolicited messages on the channels it is registered with
pub trait Receiver: Send + Sync + fmt::Debug {
    /// Name peers use to address this receiver
    fn name(&self) -> &str;

    /// A channel using this receiver opened
    fn register_channel(&self, _channel: &Arc<Channel>) {}

    /// A channel using this receiver is closing
    fn unregister_channel(&self, _channel: &Arc<Channel>) {}

    /// Handle a one-way message
    fn on_message(&self, channel: &Arc<Channel>, message: &Arc<dyn Message>) -> Result<(), ExtendError> {
        message.run(channel)
    }

    /// Handle a request, filling in its response
    fn on_request(
        &self,
        channel: &Arc<Channel>,
        request: &Arc<dyn Request>,
        response: &mut Response,
    ) -> Result<(), ExtendError> {
        request.process(channel, response)
    }

    /// A channel using this receiver has closed
    fn on_channel_closed(&self, _channel: &Arc<Channel>) {}
}

/// Moves encoded frames between two connection endpoints
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transmit one frame
    fn send(&self, frame: Bytes) -> Result<(), ExtendError>;

    /// Tell the far end the connection is gone
    fn close(&self);
}
