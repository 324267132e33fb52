//! Message, request and response contracts.
//!
//! Messages are created by a [`MessageFactory`], filled in by the sender and
//! then sealed into an immutable [`Envelope`] for transmission and dispatch.
//! The kind of every inbound message (plain, request or response) is decided
//! at decode time from the factory's type table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use extend_wire::{FieldReader, FieldWriter, Value, WireError};

use crate::channel::Channel;
use crate::error::ExtendError;
use crate::protocol::MessageFactory;

/// Property index of the request identifier in every request and response
pub const PROP_REQUEST_ID: i32 = 0;
/// Property index of the failure flag in a response
pub const PROP_FAILURE: i32 = 1;
/// Property index of the result in a response
pub const PROP_RESULT: i32 = 2;
/// First property index available to request implementations
pub const FIRST_REQUEST_PROPERTY: i32 = 1;

/// A typed, serializable unit of work
pub trait Message: Send + Sync + fmt::Debug {
    /// Protocol-scoped type identifier
    fn type_id(&self) -> i32;

    /// Whether the message must run on the connection manager's service
    /// thread, in order with other such messages
    fn execute_in_order(&self) -> bool {
        false
    }

    /// Read properties written by [`Message::write_external`]
    fn read_external(&mut self, _reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        Ok(())
    }

    /// Write this message's properties
    fn write_external(&self, _writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        Ok(())
    }

    /// Execute the message on the receiving side. Messages hold no channel
    /// of their own; the channel that received this one is supplied per call.
    fn run(&self, _channel: &Arc<Channel>) -> Result<(), ExtendError> {
        Ok(())
    }
}

/// Per-request timeout override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestTimeout {
    /// Use the connection manager's default
    #[default]
    Default,
    /// Ask for no timeout; never lifts a finite manager ceiling
    Infinite,
    /// Ask for at most this long
    After(Duration),
}

/// Combine a manager ceiling with a per-request override.
///
/// `None` means infinite. The result never exceeds a finite ceiling.
pub fn adjust_timeout(base: Option<Duration>, requested: RequestTimeout) -> Option<Duration> {
    match requested {
        RequestTimeout::Default | RequestTimeout::Infinite => base,
        RequestTimeout::After(d) => Some(base.map_or(d, |base| base.min(d))),
    }
}

/// A message that expects a [`Response`].
///
/// Implementations store the identifier handed to [`Request::set_id`] and
/// number their own properties from [`FIRST_REQUEST_PROPERTY`]; property
/// [`PROP_REQUEST_ID`] is written by the codec.
pub trait Request: Message {
    /// Channel-scoped identifier; 0 until registered
    fn id(&self) -> i64;

    /// Assign the identifier
    fn set_id(&mut self, id: i64);

    /// Type identifier of the response this request produces
    fn response_type_id(&self) -> i32 {
        0
    }

    /// Requested timeout override
    fn request_timeout(&self) -> RequestTimeout {
        RequestTimeout::Default
    }

    /// Execute the request on the receiving side, filling in `response`
    fn process(&self, channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError>;

    /// Create the matching response through `factory`
    fn ensure_response(&self, factory: &dyn MessageFactory) -> Result<Response, ExtendError> {
        match factory.create(self.response_type_id())? {
            Draft::Response(mut response) => {
                response.set_request_id(self.id());
                Ok(response)
            }
            other => Err(ExtendError::Protocol(format!(
                "type {} is a {:?}, not a response",
                self.response_type_id(),
                other.kind()
            ))),
        }
    }
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    type_id: i32,
    request_id: i64,
    failure: bool,
    result: Value,
}

impl Response {
    /// Empty response of the given type
    pub fn new(type_id: i32) -> Self {
        Self {
            type_id,
            ..Default::default()
        }
    }

    /// Protocol-scoped type identifier
    pub fn type_id(&self) -> i32 {
        self.type_id
    }

    /// Identifier of the originating request
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Set the originating request identifier
    pub fn set_request_id(&mut self, id: i64) {
        self.request_id = id;
    }

    /// Whether the request failed
    pub fn is_failure(&self) -> bool {
        self.failure
    }

    /// Mark the response failed or successful
    pub fn set_failure(&mut self, failure: bool) {
        self.failure = failure;
    }

    /// Success value, or carried error when failed
    pub fn result(&self) -> &Value {
        &self.result
    }

    /// Set the result
    pub fn set_result(&mut self, result: impl Into<Value>) {
        self.result = result.into();
    }

    /// Mark the response failed and carry `error`
    pub fn fail(&mut self, error: &ExtendError) {
        self.failure = true;
        self.result = Value::Error(error.to_remote());
    }

    /// Error described by a failed response
    pub fn error(&self) -> Option<ExtendError> {
        if !self.failure {
            return None;
        }
        Some(match &self.result {
            Value::Error(remote) => ExtendError::from_remote(remote.clone()),
            other => ExtendError::Remote(extend_wire::RemoteError::new("Exception", other.to_string())),
        })
    }

    /// Read the response properties
    pub fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.request_id = reader.read_i64(PROP_REQUEST_ID)?;
        self.failure = reader.read_bool(PROP_FAILURE)?;
        self.result = reader.read_object(PROP_RESULT)?;
        Ok(())
    }

    /// Write the response properties
    pub fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_i64(PROP_REQUEST_ID, self.request_id)?;
        writer.write_bool(PROP_FAILURE, self.failure)?;
        writer.write_object(PROP_RESULT, &self.result)
    }
}

/// The three message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// One-way message
    Message,
    /// Request expecting a response
    Request,
    /// Response to a request
    Response,
}

/// A freshly created, still mutable message
#[derive(Debug)]
pub enum Draft {
    /// One-way message
    Message(Box<dyn Message>),
    /// Request
    Request(Box<dyn Request>),
    /// Response
    Response(Response),
}

impl Draft {
    /// Kind of the draft
    pub fn kind(&self) -> MessageKind {
        match self {
            Draft::Message(_) => MessageKind::Message,
            Draft::Request(_) => MessageKind::Request,
            Draft::Response(_) => MessageKind::Response,
        }
    }

    /// Freeze into an [`Envelope`]
    pub fn seal(self) -> Envelope {
        match self {
            Draft::Message(m) => Envelope::Message(Arc::from(m)),
            Draft::Request(r) => Envelope::Request(Arc::from(r)),
            Draft::Response(r) => Envelope::Response(Arc::new(r)),
        }
    }
}

/// An immutable message ready for transmission or dispatch
#[derive(Debug, Clone)]
pub enum Envelope {
    /// One-way message
    Message(Arc<dyn Message>),
    /// Request
    Request(Arc<dyn Request>),
    /// Response
    Response(Arc<Response>),
}

impl Envelope {
    /// Kind of the envelope
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Message(_) => MessageKind::Message,
            Envelope::Request(_) => MessageKind::Request,
            Envelope::Response(_) => MessageKind::Response,
        }
    }

    /// Protocol-scoped type identifier
    pub fn type_id(&self) -> i32 {
        match self {
            Envelope::Message(m) => m.type_id(),
            Envelope::Request(r) => r.type_id(),
            Envelope::Response(r) => r.type_id(),
        }
    }

    /// Whether the message runs in order on the service thread.
    ///
    /// Responses only resolve a pending status, so they always do.
    pub fn execute_in_order(&self) -> bool {
        match self {
            Envelope::Message(m) => m.execute_in_order(),
            Envelope::Request(r) => r.execute_in_order(),
            Envelope::Response(_) => true,
        }
    }

    /// Whether the message answers an earlier request
    pub fn is_solicited(&self) -> bool {
        matches!(self, Envelope::Response(_))
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Envelope::Response(Arc::new(r))
    }
}
