//! Buffers, packed integers, typed values and serializers for extend.
//!
//! This crate provides the byte-level foundation of the extend messaging
//! protocol: growable and delegating write buffers with independent
//! positioned writers, zero-copy read buffers with independent readers, the
//! packed integer encoding, the typed value model and property-indexed user
//! type streams.
//!
//! ## Features
//!
//! - **Packed Integers**: sign bit plus 6 data bits, then 7 bits per byte
//! - **Bounded Growth**: buffers grow geometrically up to a hard maximum
//! - **Zero-Copy Views**: `ReadBuffer` sub-ranges share storage via `Bytes`
//! - **Delegating Windows**: bounded sub-regions handed to serializers
//! - **Pluggable Serializers**: native typed values or CBOR blobs
//!
//! ## Message Encoding
//!
//! ```text
//! +----------------------+----------------------------+
//! | packed type id       | message type in protocol   |
//! +----------------------+----------------------------+
//! | packed index, value  | property 0                 |
//! +----------------------+----------------------------+
//! | ...                  | ascending property indexes |
//! +----------------------+----------------------------+
//! | packed -1            | end of properties          |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod field;
pub mod read;
pub mod serializer;
pub mod value;
pub mod varint;
pub mod write;

// Re-export main types
pub use error::WireError;
pub use field::{FieldReader, FieldWriter, END_OF_PROPERTIES};
pub use read::{BufferInput, ReadBuffer};
pub use serializer::{CborSerializer, NativeSerializer, Serializer};
pub use value::{RemoteError, Value};
pub use varint::{decode_packed, encode_packed, packed_len, MAX_PACKED_LEN};
pub use write::{BufferOutput, ByteArrayWriteBuffer, DelegatingWriteBuffer, WriteBuffer};
