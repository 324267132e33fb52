//! Packed integer encoding.
//!
//! The first byte carries a sign flag (`0x40`) and the low six bits of the
//! magnitude; every following byte carries seven more bits. Bit `0x80` marks
//! that another byte follows. Negative values are stored as `!n`, so both
//! `0` and `-1` take one byte.
//!
//! ```text
//!   first byte            continuation bytes
//! +---+---+-----------+  +---+---------------+
//! | C | S |  6 bits   |  | C |    7 bits     |  ...
//! +---+---+-----------+  +---+---------------+
//! ```

use crate::error::WireError;

/// Longest encoding of a 64-bit value
pub const MAX_PACKED_LEN: usize = 10;

const CONTINUE: u8 = 0x80;
const SIGN: u8 = 0x40;

/// Encode `n` into `dst`, returning the number of bytes used.
pub fn encode_packed(n: i64, dst: &mut [u8; MAX_PACKED_LEN]) -> usize {
    let mut b = 0u8;
    let mut bits = n;
    if bits < 0 {
        b = SIGN;
        bits = !bits;
    }
    let mut bits = bits as u64;

    b |= (bits & 0x3F) as u8;
    bits >>= 6;

    let mut len = 0;
    while bits != 0 {
        dst[len] = b | CONTINUE;
        len += 1;
        b = (bits & 0x7F) as u8;
        bits >>= 7;
    }
    dst[len] = b;
    len + 1
}

/// Number of bytes `n` occupies when packed.
pub fn packed_len(n: i64) -> usize {
    let magnitude = if n < 0 { !n } else { n } as u64;
    let significant = 64 - magnitude.leading_zeros() as usize;
    if significant <= 6 {
        1
    } else {
        1 + (significant - 6).div_ceil(7)
    }
}

/// Decode a packed value from the front of `src`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_packed(src: &[u8]) -> Result<(i64, usize), WireError> {
    let first = *src.first().ok_or(WireError::Eof)?;
    let negative = first & SIGN != 0;
    let mut magnitude = (first & 0x3F) as u64;
    let mut shift = 6u32;
    let mut pos = 1;
    let mut b = first;

    while b & CONTINUE != 0 {
        b = *src.get(pos).ok_or(WireError::Eof)?;
        pos += 1;
        let bits = (b & 0x7F) as u64;
        if shift >= 64 || (shift > 57 && bits >> (64 - shift) != 0) {
            return Err(WireError::Overflow("packed integer"));
        }
        magnitude |= bits << shift;
        shift += 7;
    }

    if magnitude > i64::MAX as u64 {
        return Err(WireError::Overflow("packed integer"));
    }
    let value = magnitude as i64;
    Ok((if negative { !value } else { value }, pos))
}

/// Decode a packed value that must fit in 32 bits.
pub fn decode_packed_i32(src: &[u8]) -> Result<(i32, usize), WireError> {
    let (n, len) = decode_packed(src)?;
    let n = i32::try_from(n).map_err(|_| WireError::Overflow("int32"))?;
    Ok((n, len))
}

/// Decode a packed value that must fit in 16 bits.
pub fn decode_packed_i16(src: &[u8]) -> Result<(i16, usize), WireError> {
    let (n, len) = decode_packed(src)?;
    let n = i16::try_from(n).map_err(|_| WireError::Overflow("int16"))?;
    Ok((n, len))
}
