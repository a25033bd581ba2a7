//! # LEB128 varints
//!
//! Untagged unsigned varints: 7 bits per byte, high bit set on every byte but
//! the last. Small numbers take one byte, `u64::MAX` takes ten.

use crate::Error;
use crate::Result;

/// The longest encoding of a `u64`.
pub const MAX_LEN: usize = 10;

/// Appends `v` to `buf`.
pub fn write_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Reads one varint from the front of `buf`, advancing it.
pub fn read_u64(buf: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_LEN {
        let (&byte, rest) = buf.split_first().ok_or(Error::UnexpectedEnd)?;
        *buf = rest;

        let bits = u64::from(byte & 0x7F);
        // The tenth byte may only carry the single top bit.
        if i == MAX_LEN - 1 && bits > 1 {
            return Err(Error::VarintOverflow);
        }
        value |= bits << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::VarintOverflow)
}

/// Number of bytes `write_u64` emits for `v`.
pub fn encoded_len(v: u64) -> usize {
    let bits = 64 - v.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}
