//! Control protocol spoken on channel 0.
//!
//! | Type | Message                 | Answer                 |
//! |------|-------------------------|------------------------|
//! | 0    | `Response`              |                        |
//! | 1    | `OpenConnectionRequest` | acceptor connection id |
//! | 3    | `PingRequest`           | `true`                 |
//! | 11   | `OpenChannelRequest`    | new channel id         |
//! | 20   | `NotifyChannelClosed`   | (one-way, in order)    |

use std::sync::Arc;

use extend_wire::{FieldReader, FieldWriter, RemoteError, Value, WireError};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::channel::{Channel, Subject};
use crate::error::ExtendError;
use crate::message::{Message, Request, Response};
use crate::protocol::{MessageFactory, Protocol, ProtocolFactory};

/// Name of the control protocol
pub const MESSAGING_PROTOCOL: &str = "MessagingProtocol";
/// Newest control protocol version
pub const MESSAGING_VERSION: i32 = 3;
/// Oldest control protocol version still accepted
pub const MESSAGING_SUPPORTED_VERSION: i32 = 2;

/// Type id of control responses
pub const TYPE_RESPONSE: i32 = 0;
/// Type id of [`OpenConnectionRequest`]
pub const TYPE_OPEN_CONNECTION: i32 = 1;
/// Type id of [`PingRequest`]
pub const TYPE_PING: i32 = 3;
/// Type id of [`OpenChannelRequest`]
pub const TYPE_OPEN_CHANNEL: i32 = 11;
/// Type id of [`NotifyChannelClosed`]
pub const TYPE_NOTIFY_CHANNEL_CLOSED: i32 = 20;

static PROTOCOL: Lazy<Protocol> =
    Lazy::new(|| Protocol::new(MESSAGING_PROTOCOL, MESSAGING_VERSION, MESSAGING_SUPPORTED_VERSION));

/// The control protocol description
pub fn messaging_protocol() -> Protocol {
    PROTOCOL.clone()
}

/// Control message factory for `version`
pub fn messaging_factory(version: i32) -> Result<Arc<dyn MessageFactory>, ExtendError> {
    Ok(ProtocolFactory::builder(messaging_protocol())
        .version(version)?
        .response(TYPE_RESPONSE)
        .request(TYPE_OPEN_CONNECTION, || Box::<OpenConnectionRequest>::default())
        .request(TYPE_PING, || Box::<PingRequest>::default())
        .request(TYPE_OPEN_CHANNEL, || Box::<OpenChannelRequest>::default())
        .message(TYPE_NOTIFY_CHANNEL_CLOSED, || Box::<NotifyChannelClosed>::default())
        .build())
}

fn connection_of(channel: &Channel) -> Result<Arc<dyn crate::connection::Connection>, ExtendError> {
    channel
        .connection()
        .ok_or_else(|| ExtendError::Connection(format!("channel {} has lost its connection", channel.id())))
}

/// Handshake sent by the initiator once channel 0 is up
#[derive(Debug, Default, Clone)]
pub struct OpenConnectionRequest {
    id: i64,
    /// Service the initiator expects to reach
    pub service_name: Option<String>,
    /// Initiator edition
    pub edition: i32,
}

impl OpenConnectionRequest {
    /// Handshake for `service_name`
    pub fn new(service_name: Option<String>, edition: i32) -> Self {
        Self {
            id: 0,
            service_name,
            edition,
        }
    }
}

impl Message for OpenConnectionRequest {
    fn type_id(&self) -> i32 {
        TYPE_OPEN_CONNECTION
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.service_name = reader.read_string(1)?;
        self.edition = reader.read_i32(2)?;
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_string(1, self.service_name.as_deref())?;
        writer.write_i64(2, i64::from(self.edition))
    }
}

impl Request for OpenConnectionRequest {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn process(&self, channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError> {
        let connection = connection_of(channel)?;
        if let (Some(wanted), Some(manager)) = (&self.service_name, connection.manager()) {
            if wanted != manager.service_name() {
                return Err(ExtendError::InvalidArgument(format!(
                    "service {} is not {}",
                    manager.service_name(),
                    wanted
                )));
            }
        }
        debug!("accepted connection {} (edition {})", connection.id(), self.edition);
        response.set_result(connection.id().to_string());
        Ok(())
    }
}

/// Liveness check
#[derive(Debug, Default, Clone)]
pub struct PingRequest {
    id: i64,
}

impl Message for PingRequest {
    fn type_id(&self) -> i32 {
        TYPE_PING
    }
}

impl Request for PingRequest {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn process(&self, _channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError> {
        response.set_result(true);
        Ok(())
    }
}

/// Ask the peer to open a channel speaking `protocol`
#[derive(Debug, Default, Clone)]
pub struct OpenChannelRequest {
    id: i64,
    /// Protocol name registered with the peer
    pub protocol: String,
    /// Receiver registered with the peer
    pub receiver: Option<String>,
    /// Principal the channel acts for
    pub subject: Option<String>,
}

impl OpenChannelRequest {
    /// Open request for `protocol` served by `receiver`
    pub fn new(protocol: impl Into<String>, receiver: Option<String>, subject: Option<&Subject>) -> Self {
        Self {
            id: 0,
            protocol: protocol.into(),
            receiver,
            subject: subject.map(|s| s.name().to_owned()),
        }
    }
}

impl Message for OpenChannelRequest {
    fn type_id(&self) -> i32 {
        TYPE_OPEN_CHANNEL
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.protocol = reader.read_string(1)?.unwrap_or_default();
        self.receiver = reader.read_string(2)?;
        self.subject = reader.read_string(3)?;
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_string(1, Some(&self.protocol))?;
        writer.write_string(2, self.receiver.as_deref())?;
        writer.write_string(3, self.subject.as_deref())
    }
}

impl Request for OpenChannelRequest {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn process(&self, channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError> {
        let connection = connection_of(channel)?;
        let id = connection.accept_channel(
            &self.protocol,
            self.receiver.as_deref(),
            self.subject.clone().map(Subject::new),
        )?;
        response.set_result(id);
        Ok(())
    }
}

/// Tells the peer a channel was closed
#[derive(Debug, Default, Clone)]
pub struct NotifyChannelClosed {
    /// Closed channel
    pub channel_id: i32,
    /// Why it closed
    pub cause: Option<RemoteError>,
}

impl NotifyChannelClosed {
    /// Notification for `channel_id`
    pub fn new(channel_id: i32, cause: Option<&ExtendError>) -> Self {
        Self {
            channel_id,
            cause: cause.map(ExtendError::to_remote),
        }
    }
}

impl Message for NotifyChannelClosed {
    fn type_id(&self) -> i32 {
        TYPE_NOTIFY_CHANNEL_CLOSED
    }

    fn execute_in_order(&self) -> bool {
        true
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.channel_id = reader.read_i32(0)?;
        self.cause = match reader.read_value(1)? {
            Value::Error(remote) => Some(remote),
            Value::Null => None,
            other => Some(RemoteError::new("Exception", other.to_string())),
        };
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_i64(0, i64::from(self.channel_id))?;
        if let Some(cause) = &self.cause {
            writer.write_value(1, &Value::Error(cause.clone()))?;
        }
        Ok(())
    }

    fn run(&self, channel: &Arc<Channel>) -> Result<(), ExtendError> {
        let Some(target) = channel.connection().and_then(|c| c.channel(self.channel_id)) else {
            debug!("peer closed unknown channel {}", self.channel_id);
            return Ok(());
        };
        let cause = self.cause.clone().map(ExtendError::from_remote);
        debug!("peer closed channel {}", self.channel_id);
        target.close(false, cause)
    }
}
