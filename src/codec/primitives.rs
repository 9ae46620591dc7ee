//! Codec primitives
//!
//! Length-prefixed integers, strings and raw bytes over `bytes::{Buf, BufMut}`.
//! Every reader checks remaining input first: `Buf::get_*` panics on underflow.

use bytes::{Buf, BufMut};

use crate::error::{MuxError, Result};

/// Longest valid encoding of a u64 varint
pub const MAX_VARINT_LEN: usize = 10;

// =============================================================================
// Lengths (varint)
// =============================================================================

/// Write an unsigned integer as a LEB128 varint
pub fn write_length(value: u64, buf: &mut impl BufMut) {
    let mut value = value;
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;

        if value != 0 {
            byte |= 0x80; // Continuation bit
        }

        buf.put_u8(byte);

        if value == 0 {
            break;
        }
    }
}

/// Read a LEB128 varint
pub fn read_length(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;

    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(MuxError::Codec("truncated varint".to_string()));
        }

        let byte = buf.get_u8();
        let shift = 7 * i as u32;

        // The tenth byte may only carry the top bit of a u64
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(MuxError::Codec("varint overflows u64".to_string()));
        }

        value |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(MuxError::Codec(format!(
        "varint longer than {} bytes",
        MAX_VARINT_LEN
    )))
}

// =============================================================================
// Fixed-width integers
// =============================================================================

/// Write a 4-byte big-endian integer
pub fn write_int(value: i32, buf: &mut impl BufMut) {
    buf.put_i32(value);
}

/// Read a 4-byte big-endian integer
pub fn read_int(buf: &mut impl Buf) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(MuxError::Codec(format!(
            "truncated int: expected 4 bytes, got {}",
            buf.remaining()
        )));
    }
    Ok(buf.get_i32())
}

// =============================================================================
// Strings and raw bytes
// =============================================================================

/// Write a length-prefixed UTF-8 string
pub fn write_string(value: &str, buf: &mut impl BufMut) {
    write_bytes(value.as_bytes(), buf);
}

/// Read a length-prefixed UTF-8 string
pub fn read_string(buf: &mut impl Buf) -> Result<String> {
    let raw = read_bytes(buf)?;
    String::from_utf8(raw).map_err(|e| MuxError::Codec(format!("invalid UTF-8 string: {}", e)))
}

/// Write length-prefixed raw bytes
pub fn write_bytes(value: &[u8], buf: &mut impl BufMut) {
    write_length(value.len() as u64, buf);
    buf.put_slice(value);
}

/// Read length-prefixed raw bytes
pub fn read_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = read_length(buf)?;
    if len > buf.remaining() as u64 {
        return Err(MuxError::Codec(format!(
            "truncated bytes: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let mut out = vec![0u8; len as usize];
    buf.copy_to_slice(&mut out);
    Ok(out)
}
