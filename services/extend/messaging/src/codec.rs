//! Message codec.
//!
//! ```text
//! +------------------+---------------------------------------------+
//! | type id (packed) | properties: (packed index, value)* , -1     |
//! +------------------+---------------------------------------------+
//! ```
//!
//! Requests carry their identifier as property 0 ahead of their own
//! properties. Responses carry request id, failure flag and result as
//! properties 0, 1 and 2.

use extend_wire::{BufferInput, BufferOutput, FieldReader, FieldWriter, ReadBuffer, WireError, WriteBuffer};
use tracing::trace;

use crate::channel::Channel;
use crate::error::ExtendError;
use crate::message::{Draft, Envelope, PROP_REQUEST_ID};

/// Encodes and decodes messages using a channel's factory and serializer
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Codec {
    /// Append `message` to `buffer`
    pub fn encode(channel: &Channel, message: &Envelope, buffer: &mut dyn WriteBuffer) -> Result<(), ExtendError> {
        let type_id = message.type_id();
        match channel.factory().kind_of(type_id) {
            Some(kind) if kind == message.kind() => {}
            Some(kind) => {
                return Err(ExtendError::Protocol(format!(
                    "type {} is registered as a {:?}, not a {:?}",
                    type_id,
                    kind,
                    message.kind()
                )))
            }
            None => {
                return Err(ExtendError::Protocol(format!(
                    "type {} is not part of protocol {}",
                    type_id,
                    channel.factory().protocol().name
                )))
            }
        }

        let mut out = BufferOutput::new(buffer);
        let start = out.offset();
        out.write_packed_i32(type_id)?;
        let mut writer = FieldWriter::new(&mut out, channel.serializer().as_ref());
        match message {
            Envelope::Message(m) => m.write_external(&mut writer)?,
            Envelope::Request(r) => {
                writer.write_i64(PROP_REQUEST_ID, r.id())?;
                r.write_external(&mut writer)?;
            }
            Envelope::Response(r) => r.write_external(&mut writer)?,
        }
        writer.finish()?;

        trace!("encoded type {} on channel {} ({} bytes)", type_id, channel.id(), out.offset() - start);
        Ok(())
    }

    /// Decode one message occupying the rest of `input`.
    ///
    /// Every failure to read a well-formed message, truncation included,
    /// is reported as [`ExtendError::Protocol`].
    pub fn decode(channel: &Channel, input: &mut BufferInput<'_>) -> Result<Envelope, ExtendError> {
        Self::decode_message(channel, input).map_err(|e| match e {
            ExtendError::Bounds(wire) => ExtendError::Protocol(format!("truncated message: {wire}")),
            other => other,
        })
    }

    fn decode_message(channel: &Channel, input: &mut BufferInput<'_>) -> Result<Envelope, ExtendError> {
        let type_id = input.read_packed_i32()?;
        let mut draft = channel.factory().create(type_id)?;
        let mut reader = FieldReader::new(input, channel.serializer().as_ref());
        match &mut draft {
            Draft::Message(m) => m.read_external(&mut reader)?,
            Draft::Request(r) => {
                let id = reader.read_i64(PROP_REQUEST_ID)?;
                r.set_id(id);
                r.read_external(&mut reader)?;
            }
            Draft::Response(r) => r.read_external(&mut reader)?,
        }
        reader.read_remainder()?;
        if input.available() > 0 {
            return Err(WireError::Malformed(format!(
                "{} trailing bytes after message type {}",
                input.available(),
                type_id
            ))
            .into());
        }
        Ok(draft.seal())
    }

    /// Decode a whole buffer
    pub fn decode_buffer(channel: &Channel, buffer: &ReadBuffer) -> Result<Envelope, ExtendError> {
        Self::decode(channel, &mut buffer.input())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};
    use crate::testing::{test_factory, EchoRequest, Note, TestConnection};
    use extend_wire::{ByteArrayWriteBuffer, CborSerializer, DelegatingWriteBuffer, NativeSerializer, Value};
    use std::sync::Arc;

    fn encode(channel: &Channel, message: &Envelope) -> Vec<u8> {
        let mut buffer = ByteArrayWriteBuffer::new(64);
        Codec::encode(channel, message, &mut buffer).unwrap();
        buffer.as_slice().to_vec()
    }

    #[test]
    fn test_request_keeps_id_and_payload() {
        let connection = TestConnection::new(None);
        let channel = connection.open_channel(1);
        let mut request = EchoRequest::new("abc");
        request.set_id(5);
        let bytes = encode(&channel, &Envelope::Request(Arc::new(request)));
        assert_eq!(bytes[0], 1);
        assert_eq!(*bytes.last().unwrap(), 0x40);

        let decoded = Codec::decode_buffer(&channel, &ReadBuffer::from(bytes.clone())).unwrap();
        let Envelope::Request(decoded) = decoded else {
            panic!("expected a request");
        };
        assert_eq!(decoded.id(), 5);
        assert_eq!(decoded.type_id(), 1);
        assert_eq!(encode(&channel, &Envelope::Request(decoded)), bytes);
    }

    #[test]
    fn test_response_through_both_serializers() {
        let connection = TestConnection::new(None);
        for serializer in [
            Arc::new(NativeSerializer) as Arc<dyn extend_wire::Serializer>,
            Arc::new(CborSerializer),
        ] {
            let channel = connection.open_channel_with(1, test_factory(), serializer, None);
            let mut response = Response::new(0);
            response.set_request_id(i64::MAX);
            response.set_result(Value::Array(vec![Value::from("a"), Value::Null, Value::from(-1i64)]));

            let bytes = encode(&channel, &Envelope::from(response.clone()));
            let Envelope::Response(decoded) = Codec::decode_buffer(&channel, &ReadBuffer::from(bytes)).unwrap() else {
                panic!("expected a response");
            };
            assert_eq!(*decoded, response);
            channel.close(false, None).unwrap();
        }
    }

    #[test]
    fn test_message_round_trip() {
        let connection = TestConnection::new(None);
        let channel = connection.open_channel(1);
        let bytes = encode(&channel, &Envelope::Message(Arc::new(Note { text: "n".into() })));
        let decoded = Codec::decode_buffer(&channel, &ReadBuffer::from(bytes.clone())).unwrap();
        assert!(matches!(decoded, Envelope::Message(_)));
        assert_eq!(encode(&channel, &decoded), bytes);
    }

    #[test]
    fn test_unknown_and_mismatched_types_rejected() {
        let connection = TestConnection::new(None);
        let channel = connection.open_channel(1);

        let err = Codec::decode_buffer(&channel, &ReadBuffer::from(vec![0x09, 0x40])).unwrap_err();
        assert!(matches!(err, ExtendError::Protocol(_)));

        let mut buffer = ByteArrayWriteBuffer::new(16);
        let err = Codec::encode(&channel, &Envelope::from(Response::new(1)), &mut buffer).unwrap_err();
        assert!(matches!(err, ExtendError::Protocol(_)));
    }

    #[test]
    fn test_truncated_and_trailing_input_rejected() {
        let connection = TestConnection::new(None);
        let channel = connection.open_channel(1);
        let bytes = encode(&channel, &Envelope::Message(Arc::new(Note { text: "note".into() })));

        for cut in [1, 3, bytes.len() - 1] {
            let err = Codec::decode_buffer(&channel, &ReadBuffer::from(bytes[..cut].to_vec())).unwrap_err();
            assert!(matches!(err, ExtendError::Protocol(_)), "cut at {cut}: {err:?}");
        }

        let mut trailing = bytes;
        trailing.push(0);
        let err = Codec::decode_buffer(&channel, &ReadBuffer::from(trailing)).unwrap_err();
        assert!(matches!(err, ExtendError::Protocol(_)));
    }

    #[test]
    fn test_window_limits_message_size() {
        let connection = TestConnection::new(None);
        let channel = connection.open_channel(1);
        let mut buffer = ByteArrayWriteBuffer::new(16);
        let mut window = DelegatingWriteBuffer::new(&mut buffer, 0, 8).unwrap();

        let note = Note { text: "x".repeat(32) };
        let err = Codec::encode(&channel, &Envelope::Message(Arc::new(note)), &mut window).unwrap_err();
        assert!(matches!(err, ExtendError::Bounds(_)));
    }
}
