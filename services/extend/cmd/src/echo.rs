//! Echo protocol driven by the demo run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use extend_messaging::{
    Channel, ExtendError, Message, MessageFactory, Protocol, ProtocolFactory, Receiver, Request, Response,
    FIRST_REQUEST_PROPERTY,
};
use extend_wire::{FieldReader, FieldWriter, Value, WireError};

use crate::component_debug;

/// Protocol name
pub const ECHO_PROTOCOL: &str = "EchoProtocol";
/// Receiver name registered with the acceptor
pub const ECHO_RECEIVER: &str = "EchoService";

const TYPE_RESPONSE: i32 = 0;
const TYPE_ECHO: i32 = 1;

/// Message factory for the echo protocol
pub fn echo_factory() -> Arc<dyn MessageFactory> {
    ProtocolFactory::builder(Protocol::new(ECHO_PROTOCOL, 1, 1))
        .response(TYPE_RESPONSE)
        .request(TYPE_ECHO, || Box::<EchoRequest>::default())
        .build()
}

/// Asks the far end to send `payload` back
#[derive(Debug, Default, Clone)]
pub struct EchoRequest {
    id: i64,
    payload: Value,
}

impl EchoRequest {
    /// Create a request echoing `payload`
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            id: 0,
            payload: payload.into(),
        }
    }
}

impl Message for EchoRequest {
    fn type_id(&self) -> i32 {
        TYPE_ECHO
    }

    fn read_external(&mut self, reader: &mut FieldReader<'_, '_>) -> Result<(), WireError> {
        self.payload = reader.read_object(FIRST_REQUEST_PROPERTY)?;
        Ok(())
    }

    fn write_external(&self, writer: &mut FieldWriter<'_, '_>) -> Result<(), WireError> {
        writer.write_object(FIRST_REQUEST_PROPERTY, &self.payload)
    }
}

impl Request for EchoRequest {
    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn process(&self, _channel: &Arc<Channel>, response: &mut Response) -> Result<(), ExtendError> {
        response.set_result(self.payload.clone());
        Ok(())
    }
}

/// Serves echo channels on the acceptor
#[derive(Debug, Default)]
pub struct EchoReceiver {
    served: AtomicU64,
}

impl EchoReceiver {
    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl Receiver for EchoReceiver {
    fn name(&self) -> &str {
        ECHO_RECEIVER
    }

    fn register_channel(&self, channel: &Arc<Channel>) {
        component_debug!("echo", "serving {}", channel);
    }

    fn on_request(
        &self,
        channel: &Arc<Channel>,
        request: &Arc<dyn Request>,
        response: &mut Response,
    ) -> Result<(), ExtendError> {
        request.process(channel, response)?;
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_channel_closed(&self, channel: &Arc<Channel>) {
        component_debug!("echo", "channel {} closed after {} requests", channel.id(), self.served());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extend_messaging::{Peer, PeerConfig};

    #[test]
    fn test_echo_over_loopback() {
        let receiver = Arc::new(EchoReceiver::default());
        let acceptor = Peer::new(PeerConfig::default().with_service_name("EchoAcceptor"));
        acceptor.register_protocol(echo_factory());
        acceptor.register_receiver(receiver.clone());
        acceptor.start().unwrap();

        let initiator = Peer::new(PeerConfig::default().with_service_name("EchoClient"));
        initiator.register_protocol(echo_factory());
        initiator.start().unwrap();

        let connection = initiator.connect(&acceptor).unwrap();
        let channel = connection
            .open_channel(ECHO_PROTOCOL, Some(ECHO_RECEIVER), None, None)
            .unwrap();
        let payload = Value::Map(vec![(Value::from("k"), Value::from(3i64))]);
        let result = channel.request(Box::new(EchoRequest::new(payload.clone())), None).unwrap();
        assert_eq!(result, payload);
        assert_eq!(receiver.served(), 1);

        initiator.stop();
        acceptor.stop();
    }
}
