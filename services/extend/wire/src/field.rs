//! Property-indexed user type streams.
//!
//! A user type body is a sequence of `(packed index, typed value)` pairs in
//! ascending index order, closed by an index of `-1`. Null properties are not
//! written; a reader sees any absent property as its default.

use bytes::Bytes;

use crate::error::WireError;
use crate::read::{BufferInput, ReadBuffer};
use crate::serializer::Serializer;
use crate::value::{Value, T_OCTET_STRING, V_REFERENCE_NULL};
use crate::write::{BufferOutput, ByteArrayWriteBuffer, WriteBuffer};

/// Index that closes a property stream
pub const END_OF_PROPERTIES: i32 = -1;

/// Writes the properties of one user type
pub struct FieldWriter<'w, 'a> {
    out: &'w mut BufferOutput<'a>,
    serializer: &'w dyn Serializer,
    last: i32,
}

impl<'w, 'a> FieldWriter<'w, 'a> {
    /// Start a property stream at the current position of `out`
    pub fn new(out: &'w mut BufferOutput<'a>, serializer: &'w dyn Serializer) -> Self {
        Self {
            out,
            serializer,
            last: -1,
        }
    }

    /// Serializer used for object properties
    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer
    }

    fn begin(&mut self, index: i32) -> Result<(), WireError> {
        if index <= self.last {
            return Err(WireError::Malformed(format!(
                "property {index} written after property {}",
                self.last
            )));
        }
        self.last = index;
        self.out.write_packed_i32(index)
    }

    /// Write a typed value; null values are omitted
    pub fn write_value(&mut self, index: i32, value: &Value) -> Result<(), WireError> {
        if value.is_null() {
            return Ok(());
        }
        self.begin(index)?;
        value.write_to(self.out)
    }

    /// Write an integer property
    pub fn write_i64(&mut self, index: i32, n: i64) -> Result<(), WireError> {
        self.write_value(index, &Value::Int(n))
    }

    /// Write a boolean property
    pub fn write_bool(&mut self, index: i32, b: bool) -> Result<(), WireError> {
        self.write_value(index, &Value::Bool(b))
    }

    /// Write a string property
    pub fn write_string(&mut self, index: i32, s: Option<&str>) -> Result<(), WireError> {
        match s {
            Some(s) => self.write_value(index, &Value::Text(s.to_owned())),
            None => Ok(()),
        }
    }

    /// Write an octet string property
    pub fn write_bytes(&mut self, index: i32, b: Option<&Bytes>) -> Result<(), WireError> {
        match b {
            Some(b) => self.write_value(index, &Value::Binary(b.clone())),
            None => Ok(()),
        }
    }

    /// Write an object property through the serializer.
    ///
    /// Output of a serializer that is not payload-aware is wrapped in an
    /// octet string so the stream stays skippable.
    pub fn write_object(&mut self, index: i32, value: &Value) -> Result<(), WireError> {
        if value.is_null() {
            return Ok(());
        }
        if self.serializer.is_payload_aware() {
            self.begin(index)?;
            return self.serializer.serialize(self.out, value);
        }

        let mut blob = ByteArrayWriteBuffer::new(64);
        self.serializer.serialize(&mut blob.output(), value)?;
        self.begin(index)?;
        self.out.write_packed_i32(T_OCTET_STRING)?;
        self.out.write_octets(Some(blob.as_slice()))
    }

    /// Close the stream
    pub fn finish(self) -> Result<(), WireError> {
        self.out.write_packed_i32(END_OF_PROPERTIES)
    }
}

/// Reads the properties of one user type.
///
/// Properties must be requested in ascending index order. Properties the
/// reader never asks for are skipped.
pub struct FieldReader<'r, 'a> {
    input: &'r mut BufferInput<'a>,
    serializer: &'r dyn Serializer,
    next: Option<i32>,
    last: i32,
}

impl<'r, 'a> FieldReader<'r, 'a> {
    /// Start reading a property stream at the current position of `input`
    pub fn new(input: &'r mut BufferInput<'a>, serializer: &'r dyn Serializer) -> Self {
        Self {
            input,
            serializer,
            next: None,
            last: -1,
        }
    }

    /// Serializer used for object properties
    pub fn serializer(&self) -> &dyn Serializer {
        self.serializer
    }

    fn peek(&mut self) -> Result<i32, WireError> {
        match self.next {
            Some(index) => Ok(index),
            None => {
                let index = self.input.read_packed_i32()?;
                if index < END_OF_PROPERTIES {
                    return Err(WireError::Malformed(format!("negative property index {index}")));
                }
                self.next = Some(index);
                Ok(index)
            }
        }
    }

    /// Position on property `index`; `false` when it is absent
    fn seek(&mut self, index: i32) -> Result<bool, WireError> {
        if index <= self.last {
            return Err(WireError::Malformed(format!(
                "property {index} read after property {}",
                self.last
            )));
        }
        self.last = index;
        loop {
            let next = self.peek()?;
            if next == END_OF_PROPERTIES || next > index {
                return Ok(false);
            }
            self.next = None;
            if next == index {
                return Ok(true);
            }
            Value::read_from(self.input)?;
        }
    }

    /// Read a typed value; absent properties read as null
    pub fn read_value(&mut self, index: i32) -> Result<Value, WireError> {
        if !self.seek(index)? {
            return Ok(Value::Null);
        }
        Value::read_from(self.input)
    }

    /// Read an integer property, defaulting to 0
    pub fn read_i64(&mut self, index: i32) -> Result<i64, WireError> {
        match self.read_value(index)? {
            Value::Null => Ok(0),
            Value::Int(n) => Ok(n),
            other => Err(type_mismatch(index, "integer", &other)),
        }
    }

    /// Read a 32-bit integer property, defaulting to 0
    pub fn read_i32(&mut self, index: i32) -> Result<i32, WireError> {
        let n = self.read_i64(index)?;
        i32::try_from(n).map_err(|_| WireError::Overflow("int32"))
    }

    /// Read a boolean property, defaulting to `false`
    pub fn read_bool(&mut self, index: i32) -> Result<bool, WireError> {
        match self.read_value(index)? {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            other => Err(type_mismatch(index, "boolean", &other)),
        }
    }

    /// Read a string property
    pub fn read_string(&mut self, index: i32) -> Result<Option<String>, WireError> {
        match self.read_value(index)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(type_mismatch(index, "string", &other)),
        }
    }

    /// Read an octet string property
    pub fn read_bytes(&mut self, index: i32) -> Result<Option<Bytes>, WireError> {
        match self.read_value(index)? {
            Value::Null => Ok(None),
            Value::Binary(b) => Ok(Some(b)),
            other => Err(type_mismatch(index, "octet string", &other)),
        }
    }

    /// Read an object property through the serializer
    pub fn read_object(&mut self, index: i32) -> Result<Value, WireError> {
        if !self.seek(index)? {
            return Ok(Value::Null);
        }
        if self.serializer.is_payload_aware() {
            return self.serializer.deserialize(self.input);
        }

        let blob: ReadBuffer = match self.input.read_packed_i32()? {
            T_OCTET_STRING => match self.input.read_octets()? {
                Some(blob) => blob,
                None => return Ok(Value::Null),
            },
            V_REFERENCE_NULL => return Ok(Value::Null),
            other => {
                return Err(WireError::Malformed(format!(
                    "property {index}: expected octet string, found type {other}"
                )))
            }
        };
        let mut blob_input = blob.input();
        self.serializer.deserialize(&mut blob_input)
    }

    /// Skip any unread properties and consume the terminator
    pub fn read_remainder(mut self) -> Result<(), WireError> {
        loop {
            let next = self.peek()?;
            self.next = None;
            if next == END_OF_PROPERTIES {
                return Ok(());
            }
            Value::read_from(self.input)?;
        }
    }
}

fn type_mismatch(index: i32, expected: &str, found: &Value) -> WireError {
    WireError::Malformed(format!("property {index}: expected {expected}, found {found:?}"))
}
