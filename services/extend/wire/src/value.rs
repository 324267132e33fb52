//! Self-describing typed values.
//!
//! Every value is written as a packed type identifier followed by its body.
//! Small integers, booleans, null, empty strings and empty collections are
//! folded into the identifier itself.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::read::BufferInput;
use crate::write::BufferOutput;

/// 64-bit integer
pub const T_INT64: i32 = -3;
/// 64-bit float
pub const T_FLOAT64: i32 = -6;
/// Boolean
pub const T_BOOLEAN: i32 = -11;
/// Octet string
pub const T_OCTET_STRING: i32 = -13;
/// Character string
pub const T_CHAR_STRING: i32 = -15;
/// Collection of values
pub const T_COLLECTION: i32 = -22;
/// Map of values
pub const T_MAP: i32 = -28;
/// Boolean `false`
pub const V_BOOLEAN_FALSE: i32 = -33;
/// Boolean `true`
pub const V_BOOLEAN_TRUE: i32 = -34;
/// Empty string
pub const V_STRING_ZERO_LENGTH: i32 = -35;
/// Empty collection
pub const V_COLLECTION_EMPTY: i32 = -36;
/// Null reference
pub const V_REFERENCE_NULL: i32 = -37;
/// Positive infinity
pub const V_FP_POS_INFINITY: i32 = -38;
/// Negative infinity
pub const V_FP_NEG_INFINITY: i32 = -39;
/// Not a number
pub const V_FP_NAN: i32 = -40;
/// Integer -1; `V_INT_0 - n` encodes `n` for `-1 <= n <= 22`
pub const V_INT_NEG_1: i32 = -41;
/// Integer 0
pub const V_INT_0: i32 = -42;
/// Largest integer folded into the type identifier
pub const V_INT_MAX_FOLDED: i64 = 22;

/// User type 0 carries an error raised by the peer
pub const T_REMOTE_ERROR: i32 = 0;

/// Nesting limit for collections read from the wire
pub const MAX_DEPTH: usize = 64;

/// An error carried inside a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error category as named by the raising side
    pub kind: String,
    /// Human readable detail
    pub message: String,
}

impl RemoteError {
    /// Create a carried error
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Typed value model used for message properties and results
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Absent / null
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Double precision float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw octets
    Binary(Bytes),
    /// Ordered collection
    Array(Vec<Value>),
    /// Key/value pairs in insertion order
    Map(Vec<(Value, Value)>),
    /// Carried error
    Error(RemoteError),
}

impl Value {
    /// Whether this is [`Value::Null`]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer content, if any
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Text content, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Write the type identifier and body
    pub fn write_to(&self, out: &mut BufferOutput<'_>) -> Result<(), WireError> {
        match self {
            Value::Null => out.write_packed_i32(V_REFERENCE_NULL),
            Value::Bool(true) => out.write_packed_i32(V_BOOLEAN_TRUE),
            Value::Bool(false) => out.write_packed_i32(V_BOOLEAN_FALSE),
            Value::Int(n) if (-1..=V_INT_MAX_FOLDED).contains(n) => {
                out.write_packed_i32(V_INT_0 - *n as i32)
            }
            Value::Int(n) => {
                out.write_packed_i32(T_INT64)?;
                out.write_packed_i64(*n)
            }
            Value::Float(v) if v.is_nan() => out.write_packed_i32(V_FP_NAN),
            Value::Float(v) if *v == f64::INFINITY => out.write_packed_i32(V_FP_POS_INFINITY),
            Value::Float(v) if *v == f64::NEG_INFINITY => out.write_packed_i32(V_FP_NEG_INFINITY),
            Value::Float(v) => {
                out.write_packed_i32(T_FLOAT64)?;
                out.write_f64(*v)
            }
            Value::Text(s) if s.is_empty() => out.write_packed_i32(V_STRING_ZERO_LENGTH),
            Value::Text(s) => {
                out.write_packed_i32(T_CHAR_STRING)?;
                out.write_string(Some(s))
            }
            Value::Binary(b) => {
                out.write_packed_i32(T_OCTET_STRING)?;
                out.write_octets(Some(b))
            }
            Value::Array(items) if items.is_empty() => out.write_packed_i32(V_COLLECTION_EMPTY),
            Value::Array(items) => {
                out.write_packed_i32(T_COLLECTION)?;
                write_count(out, items.len())?;
                items.iter().try_for_each(|v| v.write_to(out))
            }
            Value::Map(entries) => {
                out.write_packed_i32(T_MAP)?;
                write_count(out, entries.len())?;
                entries.iter().try_for_each(|(k, v)| {
                    k.write_to(out)?;
                    v.write_to(out)
                })
            }
            Value::Error(e) => {
                out.write_packed_i32(T_REMOTE_ERROR)?;
                out.write_string(Some(&e.kind))?;
                out.write_string(Some(&e.message))
            }
        }
    }

    /// Read a value written by [`Value::write_to`]
    pub fn read_from(input: &mut BufferInput<'_>) -> Result<Value, WireError> {
        let type_id = input.read_packed_i32()?;
        Self::read_body(type_id, input, 0)
    }

    /// Read the body of a value whose type identifier was already consumed
    pub fn read_body(type_id: i32, input: &mut BufferInput<'_>, depth: usize) -> Result<Value, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::Malformed(format!("nesting deeper than {MAX_DEPTH}")));
        }
        let value = match type_id {
            V_REFERENCE_NULL => Value::Null,
            V_BOOLEAN_TRUE => Value::Bool(true),
            V_BOOLEAN_FALSE => Value::Bool(false),
            T_BOOLEAN => Value::Bool(input.read_packed_i32()? != 0),
            id if (V_INT_0 - V_INT_MAX_FOLDED as i32..=V_INT_NEG_1).contains(&id) => {
                Value::Int((V_INT_0 - id) as i64)
            }
            T_INT64 => Value::Int(input.read_packed_i64()?),
            T_FLOAT64 => Value::Float(input.read_f64()?),
            V_FP_NAN => Value::Float(f64::NAN),
            V_FP_POS_INFINITY => Value::Float(f64::INFINITY),
            V_FP_NEG_INFINITY => Value::Float(f64::NEG_INFINITY),
            V_STRING_ZERO_LENGTH => Value::Text(String::new()),
            T_CHAR_STRING => Value::Text(input.read_string()?.unwrap_or_default()),
            T_OCTET_STRING => match input.read_octets()? {
                Some(buf) => Value::Binary(buf.to_bytes()),
                None => Value::Null,
            },
            V_COLLECTION_EMPTY => Value::Array(Vec::new()),
            T_COLLECTION => {
                let count = read_count(input)?;
                let mut items = Vec::with_capacity(count.min(PREALLOC_LIMIT));
                for _ in 0..count {
                    let id = input.read_packed_i32()?;
                    items.push(Self::read_body(id, input, depth + 1)?);
                }
                Value::Array(items)
            }
            T_MAP => {
                let count = read_count(input)?;
                let mut entries = Vec::with_capacity(count.min(PREALLOC_LIMIT));
                for _ in 0..count {
                    let id = input.read_packed_i32()?;
                    let key = Self::read_body(id, input, depth + 1)?;
                    let id = input.read_packed_i32()?;
                    let value = Self::read_body(id, input, depth + 1)?;
                    entries.push((key, value));
                }
                Value::Map(entries)
            }
            T_REMOTE_ERROR => Value::Error(RemoteError {
                kind: input.read_string()?.unwrap_or_default(),
                message: input.read_string()?.unwrap_or_default(),
            }),
            other => return Err(WireError::Type(other)),
        };
        Ok(value)
    }
}

/// Most elements reserved up front for a collection read off the wire
const PREALLOC_LIMIT: usize = 16;

fn write_count(out: &mut BufferOutput<'_>, count: usize) -> Result<(), WireError> {
    let count = i32::try_from(count).map_err(|_| WireError::Overflow("collection size"))?;
    out.write_packed_i32(count)
}

fn read_count(input: &mut BufferInput<'_>) -> Result<usize, WireError> {
    let count = input.read_packed_i32()?;
    usize::try_from(count).map_err(|_| WireError::Malformed(format!("negative collection size {count}")))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Value::Array(items) => write!(f, "[{} items]", items.len()),
            Value::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
            Value::Error(e) => write!(f, "{e}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Value::Null, Value::Text)
    }
}

impl From<RemoteError> for Value {
    fn from(e: RemoteError) -> Self {
        Value::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{ByteArrayWriteBuffer, WriteBuffer};

    fn round_trip(value: &Value) -> Value {
        let mut buf = ByteArrayWriteBuffer::new(0);
        value.write_to(&mut buf.output()).unwrap();
        let read = buf.freeze();
        let mut input = read.input();
        let back = Value::read_from(&mut input).unwrap();
        assert_eq!(input.available(), 0);
        back
    }

    #[test]
    fn test_scalars() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-1),
            Value::Int(22),
            Value::Int(23),
            Value::Int(-2),
            Value::Int(i64::MIN),
            Value::Int(i64::MAX),
            Value::Float(0.25),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Text(String::new()),
            Value::Text("grüße".into()),
            Value::Binary(Bytes::from_static(b"\x00\x01")),
        ] {
            assert_eq!(round_trip(&v), v);
        }
        assert!(matches!(round_trip(&Value::Float(f64::NAN)), Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_small_ints_fold_into_type_id() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        Value::Int(5).write_to(&mut buf.output()).unwrap();
        assert_eq!(buf.len(), 1);
        Value::Null.write_to(&mut buf.output()).unwrap();
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_nested() {
        let v = Value::Map(vec![
            (Value::from("a"), Value::Array(vec![Value::Int(1), Value::Null])),
            (Value::Int(7), Value::Array(Vec::new())),
            (
                Value::from("err"),
                Value::Error(RemoteError::new("Protocol", "bad frame")),
            ),
        ]);
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        buf.output().write_packed_i32(-99).unwrap();
        let read = buf.freeze();
        assert_eq!(Value::read_from(&mut read.input()), Err(WireError::Type(-99)));
    }

    #[test]
    fn test_depth_limit() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        let mut out = buf.output();
        for _ in 0..=MAX_DEPTH + 1 {
            out.write_packed_i32(T_COLLECTION).unwrap();
            out.write_packed_i32(1).unwrap();
        }
        out.write_packed_i32(V_REFERENCE_NULL).unwrap();
        drop(out);
        let read = buf.freeze();
        assert!(matches!(
            Value::read_from(&mut read.input()),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_huge_nested_counts_fail_without_reserving() {
        let mut buf = ByteArrayWriteBuffer::new(0);
        let mut out = buf.output();
        for level in 0..MAX_DEPTH {
            out.write_packed_i32(if level % 2 == 0 { T_COLLECTION } else { T_MAP }).unwrap();
            out.write_packed_i32(i32::MAX).unwrap();
        }
        drop(out);
        let read = buf.freeze();
        assert_eq!(Value::read_from(&mut read.input()), Err(WireError::Eof));
    }
}
