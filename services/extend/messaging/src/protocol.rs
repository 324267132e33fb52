//! Protocols and message factories.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ExtendError;
use crate::message::{Draft, Message, MessageKind, Request, Response};

/// A named, versioned set of message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    /// Protocol name
    pub name: String,
    /// Newest version spoken
    pub current_version: i32,
    /// Oldest version still accepted
    pub supported_version: i32,
}

impl Protocol {
    /// Describe a protocol
    pub fn new(name: impl Into<String>, current_version: i32, supported_version: i32) -> Self {
        Self {
            name: name.into(),
            current_version,
            supported_version,
        }
    }

    /// Whether `version` falls in the supported range
    pub fn supports(&self, version: i32) -> bool {
        (self.supported_version..=self.current_version).contains(&version)
    }
}

/// Creates messages of one protocol version
pub trait MessageFactory: Send + Sync + fmt::Debug {
    /// Protocol this factory belongs to
    fn protocol(&self) -> &Protocol;

    /// Negotiated protocol version
    fn version(&self) -> i32;

    /// Kind of message registered under `type_id`
    fn kind_of(&self, type_id: i32) -> Option<MessageKind>;

    /// Create an empty message of type `type_id`
    fn create(&self, type_id: i32) -> Result<Draft, ExtendError>;
}

type MessageCtor = Arc<dyn Fn() -> Box<dyn Message> + Send + Sync>;
type RequestCtor = Arc<dyn Fn() -> Box<dyn Request> + Send + Sync>;

#[derive(Clone)]
enum Constructor {
    Message(MessageCtor),
    Request(RequestCtor),
    Response,
}

impl Constructor {
    fn kind(&self) -> MessageKind {
        match self {
            Constructor::Message(_) => MessageKind::Message,
            Constructor::Request(_) => MessageKind::Request,
            Constructor::Response => MessageKind::Response,
        }
    }
}

/// Table-driven [`MessageFactory`]
#[derive(Clone)]
pub struct ProtocolFactory {
    protocol: Protocol,
    version: i32,
    types: HashMap<i32, Constructor>,
}

impl fmt::Debug for ProtocolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.types.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ProtocolFactory")
            .field("protocol", &self.protocol.name)
            .field("version", &self.version)
            .field("types", &ids)
            .finish()
    }
}

impl ProtocolFactory {
    /// Start building a factory for `protocol` at its current version
    pub fn builder(protocol: Protocol) -> ProtocolFactoryBuilder {
        let version = protocol.current_version;
        ProtocolFactoryBuilder {
            factory: ProtocolFactory {
                protocol,
                version,
                types: HashMap::new(),
            },
        }
    }
}

impl MessageFactory for ProtocolFactory {
    fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn kind_of(&self, type_id: i32) -> Option<MessageKind> {
        self.types.get(&type_id).map(Constructor::kind)
    }

    fn create(&self, type_id: i32) -> Result<Draft, ExtendError> {
        match self.types.get(&type_id) {
            Some(Constructor::Message(ctor)) => Ok(Draft::Message(ctor())),
            Some(Constructor::Request(ctor)) => Ok(Draft::Request(ctor())),
            Some(Constructor::Response) => Ok(Draft::Response(Response::new(type_id))),
            None => Err(ExtendError::Protocol(format!(
                "unknown message type {} in protocol {} v{}",
                type_id, self.protocol.name, self.version
            ))),
        }
    }
}

/// Builder for [`ProtocolFactory`]
pub struct ProtocolFactoryBuilder {
    factory: ProtocolFactory,
}

impl ProtocolFactoryBuilder {
    /// Negotiated version; must be within the protocol's supported range
    pub fn version(mut self, version: i32) -> Result<Self, ExtendError> {
        if !self.factory.protocol.supports(version) {
            return Err(ExtendError::InvalidArgument(format!(
                "protocol {} does not support version {}",
                self.factory.protocol.name, version
            )));
        }
        self.factory.version = version;
        Ok(self)
    }

    /// Register a one-way message type
    pub fn message<F>(mut self, type_id: i32, ctor: F) -> Self
    where
        F: Fn() -> Box<dyn Message> + Send + Sync + 'static,
    {
        self.factory
            .types
            .insert(type_id, Constructor::Message(Arc::new(ctor)));
        self
    }

    /// Register a request type
    pub fn request<F>(mut self, type_id: i32, ctor: F) -> Self
    where
        F: Fn() -> Box<dyn Request> + Send + Sync + 'static,
    {
        self.factory
            .types
            .insert(type_id, Constructor::Request(Arc::new(ctor)));
        self
    }

    /// Register a response type
    pub fn response(mut self, type_id: i32) -> Self {
        self.factory.types.insert(type_id, Constructor::Response);
        self
    }

    /// Finish the factory
    pub fn build(self) -> Arc<dyn MessageFactory> {
        Arc::new(self.factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Note;

    impl Message for Note {
        fn type_id(&self) -> i32 {
            7
        }
    }

    #[test]
    fn test_create_by_kind() {
        let factory = ProtocolFactory::builder(Protocol::new("Test", 2, 1))
            .message(7, || Box::new(Note))
            .response(0)
            .build();

        assert_eq!(factory.kind_of(7), Some(MessageKind::Message));
        assert_eq!(factory.kind_of(0), Some(MessageKind::Response));
        assert_eq!(factory.kind_of(8), None);
        assert_eq!(factory.create(0).unwrap().kind(), MessageKind::Response);
        assert!(matches!(factory.create(8), Err(ExtendError::Protocol(_))));
        assert_eq!(factory.version(), 2);
    }

    #[test]
    fn test_version_range() {
        let protocol = Protocol::new("Test", 3, 2);
        assert!(ProtocolFactory::builder(protocol.clone()).version(2).is_ok());
        assert!(ProtocolFactory::builder(protocol).version(1).is_err());
    }
}
