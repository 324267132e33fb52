//! Object serializers.
//!
//! A payload-aware serializer writes values inline as typed values, so any
//! reader can skip them. Other serializers produce an opaque blob, which the
//! property stream wraps as an octet string.

use std::fmt;

use crate::error::WireError;
use crate::read::BufferInput;
use crate::value::Value;
use crate::write::BufferOutput;

/// Converts values to and from bytes
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Name used in logs and channel descriptions
    fn name(&self) -> &str;

    /// Whether output is a self-describing typed value
    fn is_payload_aware(&self) -> bool;

    /// Write `value` at the current position of `out`
    fn serialize(&self, out: &mut BufferOutput<'_>, value: &Value) -> Result<(), WireError>;

    /// Read a value starting at the current position of `input`
    fn deserialize(&self, input: &mut BufferInput<'_>) -> Result<Value, WireError>;
}

/// Writes values using the native typed encoding
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerializer;

impl Serializer for NativeSerializer {
    fn name(&self) -> &str {
        "native"
    }

    fn is_payload_aware(&self) -> bool {
        true
    }

    fn serialize(&self, out: &mut BufferOutput<'_>, value: &Value) -> Result<(), WireError> {
        value.write_to(out)
    }

    fn deserialize(&self, input: &mut BufferInput<'_>) -> Result<Value, WireError> {
        Value::read_from(input)
    }
}

/// Writes values as CBOR blobs
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn name(&self) -> &str {
        "cbor"
    }

    fn is_payload_aware(&self) -> bool {
        false
    }

    fn serialize(&self, out: &mut BufferOutput<'_>, value: &Value) -> Result<(), WireError> {
        let mut blob = Vec::new();
        ciborium::into_writer(value, &mut blob)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        out.write_bytes(&blob)
    }

    fn deserialize(&self, input: &mut BufferInput<'_>) -> Result<Value, WireError> {
        let mut remaining = input.remaining();
        let before = remaining.len();
        let value = ciborium::from_reader(&mut remaining)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        input.skip(before - remaining.len());
        Ok(value)
    }
}
