//! # Increasing Sequence Compression
//!
//! Compact encoding for sets of call ids, used by the reconnect handshake.
//!
//! ```text
//! [count: varint] [first: varint] [delta_1: varint] ... [delta_{count-1}: varint]
//! ```
//!
//! Input is sorted and deduplicated first, so every delta is at least 1 and a
//! dense id range costs about one byte per id.
//!
//! ## Invariants
//! - `decompress(compress(xs)) == sorted(dedup(xs))`.
//! - The empty set encodes to a single zero byte.
//! - Decoding rejects trailing bytes and deltas that would overflow `u64`.

use tetherpack::varint;

use crate::error::Error;
use crate::error::Result;

/// Compresses a set of ids into the delta/varint form.
pub fn compress<I>(ids: I) -> Vec<u8>
where
    I: IntoIterator<Item = u64>,
{
    let mut ids: Vec<u64> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut out = Vec::with_capacity(ids.len() + varint::MAX_LEN);
    varint::write_u64(&mut out, ids.len() as u64);

    let mut prev = None;
    for id in ids {
        match prev {
            None => varint::write_u64(&mut out, id),
            Some(p) => varint::write_u64(&mut out, id - p),
        }
        prev = Some(id);
    }
    out
}

/// Restores the sorted id list produced by [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u64>> {
    let mut cursor = bytes;
    let count = varint::read_u64(&mut cursor)?;

    // Every entry takes at least one byte.
    if count > cursor.len() as u64 {
        return Err(Error::ProtocolViolation(format!(
            "sequence claims {} ids but only {} bytes follow",
            count,
            cursor.len()
        )));
    }

    let mut ids = Vec::with_capacity(count as usize);
    let mut prev: Option<u64> = None;
    for _ in 0..count {
        let raw = varint::read_u64(&mut cursor)?;
        let id = match prev {
            None => raw,
            Some(p) => {
                if raw == 0 {
                    return Err(Error::ProtocolViolation("sequence is not strictly increasing".into()));
                }
                p.checked_add(raw)
                    .ok_or_else(|| Error::ProtocolViolation("sequence overflows u64".into()))?
            }
        };
        ids.push(id);
        prev = Some(id);
    }

    if !cursor.is_empty() {
        return Err(Error::ProtocolViolation(format!("{} trailing bytes after sequence", cursor.len())));
    }
    Ok(ids)
}
