//! Order-preserving encoding for variable-length byte strings.
//!
//! Each value is escaped and followed by a `0x00` terminator:
//!
//! - `0x00` → `0x01 0x01`
//! - `0x01` → `0x01 0x02`
//! - all other bytes unchanged
//!
//! An encoded value never contains `0x00` before its terminator, so the
//! terminator sorts below every byte a value can produce. Comparing two
//! encodings byte-wise gives the same result as comparing the raw values,
//! and a shorter value sorts before any longer value it prefixes.
//!
//! Concatenating several encodings yields a composite key whose ordering is
//! component-wise. All keys sharing the first K components lie in
//! `[p, p[..len-1] ++ 0x01)` where `p` is the encoding of those components:
//! see [`prefix_upper_bound`].

use bytes::{BufMut, Bytes, BytesMut};

/// Terminates every encoded value. Sorts below all encoded bytes.
pub const TERMINATOR: u8 = 0x00;

/// Escape marker. Also the byte immediately following [`TERMINATOR`].
pub const ESCAPE: u8 = 0x01;

/// Appends the escaped, terminated encoding of `value` to `buf`.
pub fn serialize(value: &[u8], buf: &mut BytesMut) {
    buf.reserve(value.len() + 1);
    for &byte in value {
        match byte {
            0x00 => buf.put_slice(&[ESCAPE, 0x01]),
            0x01 => buf.put_slice(&[ESCAPE, 0x02]),
            other => buf.put_u8(other),
        }
    }
    buf.put_u8(TERMINATOR);
}

/// Exclusive upper bound for every key that starts with the terminated
/// encoding `encoded`: the final terminator is replaced by [`ESCAPE`].
///
/// Returns `None` if `encoded` does not end with a terminator.
pub fn prefix_upper_bound(encoded: &[u8]) -> Option<Bytes> {
    match encoded.split_last() {
        Some((&TERMINATOR, head)) => {
            let mut end = BytesMut::with_capacity(encoded.len());
            end.put_slice(head);
            end.put_u8(ESCAPE);
            Some(end.freeze())
        }
        _ => None,
    }
}
