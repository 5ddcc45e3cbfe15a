//! Serde for feed index storage
//!
//! This module encodes cursors and index entries into the ordered key-value
//! store, and encodes composite index keys so that byte order matches the
//! intended component order.
//!
//! # Key Format
//!
//! All keys start with a version byte and record type discriminator:
//!
//! ```text
//! | version (u8) | type (u8) | ... record-specific fields ... |
//! ```
//!
//! # Record Types
//!
//! - `Cursor` (0x01): per-log numeric id and resume sequence
//! - `IndexEntry` (0x02): one member of an index partition
//!
//! # Composite Keys
//!
//! Every key component is escaped and terminated with `0x00` (see
//! [`common::serde::terminated_bytes`]). The terminator sorts below every
//! byte a component can produce, so all keys sharing a K-component prefix
//! `P` form the contiguous range `[P, P[..len-1] ++ 0x01)`.

use std::fmt;
use std::ops::Bound;

use bytes::{BufMut, Bytes, BytesMut};
use common::BytesRange;
use common::serde::terminated_bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{KeyComponent, LogId, Locator};

/// Key format version (currently 0x01)
pub const KEY_VERSION: u8 = 0x01;

/// Encoded `false`. Sorts before [`TRUE_BYTE`].
const FALSE_BYTE: u8 = b'f';
/// Encoded `true`.
const TRUE_BYTE: u8 = b't';

/// Record type discriminators for feed index storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Per-log cursor record
    Cursor = 0x01,
    /// Index partition entry
    IndexEntry = 0x02,
}

impl RecordType {
    /// Returns the ID of this record type
    pub fn id(&self) -> u8 {
        *self as u8
    }

    /// Converts a u8 id back to a RecordType
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(RecordType::Cursor),
            0x02 => Ok(RecordType::IndexEntry),
            _ => Err(Error::Encoding(format!(
                "invalid record type: 0x{:02x}",
                id
            ))),
        }
    }

    fn prefix(&self) -> [u8; 2] {
        [KEY_VERSION, self.id()]
    }
}

fn check_header(data: &[u8], expected: RecordType) -> Result<()> {
    if data.len() < 2 {
        return Err(Error::Encoding(format!(
            "buffer too short for {:?} key",
            expected
        )));
    }
    if data[0] != KEY_VERSION {
        return Err(Error::Encoding(format!(
            "invalid key version: expected 0x{:02x}, got 0x{:02x}",
            KEY_VERSION, data[0]
        )));
    }
    let record_type = RecordType::from_id(data[1])?;
    if record_type != expected {
        return Err(Error::Encoding(format!(
            "invalid record type: expected {:?}, got {:?}",
            expected, record_type
        )));
    }
    Ok(())
}

/// How integer key components are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegerEncoding {
    /// 8-byte big-endian with the sign bit flipped. Byte order equals
    /// numeric order for every `i64`.
    #[default]
    OrderPreserving,
    /// Decimal string. Sorts lexicographically, so `10 < 9`.
    Decimal,
}

/// Encodes composite keys into order-preserving bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyEncoder {
    integers: IntegerEncoding,
}

impl KeyEncoder {
    pub fn new(integers: IntegerEncoding) -> Self {
        Self { integers }
    }

    /// Encodes each component followed by the separator.
    pub fn encode(&self, components: &[KeyComponent]) -> Bytes {
        let mut buf = BytesMut::new();
        for component in components {
            self.encode_component(component, &mut buf);
        }
        buf.freeze()
    }

    fn encode_component(&self, component: &KeyComponent, buf: &mut BytesMut) {
        match component {
            KeyComponent::String(s) => terminated_bytes::serialize(s.as_bytes(), buf),
            KeyComponent::Bytes(b) => terminated_bytes::serialize(b, buf),
            KeyComponent::Bool(b) => {
                let byte = if *b { TRUE_BYTE } else { FALSE_BYTE };
                terminated_bytes::serialize(&[byte], buf)
            }
            KeyComponent::Int(i) => match self.integers {
                IntegerEncoding::OrderPreserving => {
                    let flipped = (*i as u64) ^ (1 << 63);
                    terminated_bytes::serialize(&flipped.to_be_bytes(), buf)
                }
                IntegerEncoding::Decimal => {
                    terminated_bytes::serialize(i.to_string().as_bytes(), buf)
                }
            },
        }
    }
}

/// Key for a cursor record.
///
/// ```text
/// | version (u8) | type (u8=0x01) | hex(log_id) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorKey {
    pub log_id: LogId,
}

impl CursorKey {
    pub fn new(log_id: LogId) -> Self {
        Self { log_id }
    }

    pub fn serialize(&self) -> Bytes {
        let hex = self.log_id.to_hex();
        let mut buf = BytesMut::with_capacity(2 + hex.len());
        buf.put_slice(&RecordType::Cursor.prefix());
        buf.put_slice(hex.as_bytes());
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        check_header(data, RecordType::Cursor)?;
        let hex = std::str::from_utf8(&data[2..])
            .map_err(|e| Error::Encoding(format!("cursor key is not utf-8: {}", e)))?;
        Ok(CursorKey {
            log_id: LogId::from_hex(hex)?,
        })
    }

    /// Range covering every cursor record.
    pub fn scan_range() -> BytesRange {
        BytesRange::prefix(Bytes::copy_from_slice(&RecordType::Cursor.prefix()))
    }
}

/// Value for a cursor record.
///
/// ```text
/// | numeric_id (u32 BE) | next_sequence (u64 BE) |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorValue {
    pub numeric_id: u32,
    pub next_sequence: u64,
}

impl CursorValue {
    pub fn new(numeric_id: u32, next_sequence: u64) -> Self {
        Self {
            numeric_id,
            next_sequence,
        }
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(self.numeric_id);
        buf.put_u64(self.next_sequence);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Encoding("cursor value is missing numeric id".to_string()));
        }
        if data.len() < 12 {
            return Err(Error::Encoding(format!(
                "buffer too short for cursor value: need 12 bytes, got {}",
                data.len()
            )));
        }
        let numeric_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let next_sequence = u64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        Ok(CursorValue {
            numeric_id,
            next_sequence,
        })
    }
}

/// Key prefix shared by every entry of one index partition.
///
/// ```text
/// | version (u8) | type (u8=0x02) | terminated(index_name) |
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct IndexNamespace(Bytes);

impl IndexNamespace {
    pub fn new(index_name: &str) -> Self {
        let mut buf = BytesMut::with_capacity(index_name.len() + 3);
        buf.put_slice(&RecordType::IndexEntry.prefix());
        terminated_bytes::serialize(index_name.as_bytes(), &mut buf);
        Self(buf.freeze())
    }

    /// Full storage key for an entry whose composite key encodes to `encoded`.
    pub fn entry_key(&self, encoded: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.0.len() + encoded.len());
        buf.put_slice(&self.0);
        buf.put_slice(encoded);
        buf.freeze()
    }

    /// Namespace nested under the encoded leading components. Its entry keys
    /// are byte-identical to this namespace's keys for the combined key.
    pub fn child(&self, encoded_leading: &[u8]) -> Self {
        Self(self.entry_key(encoded_leading))
    }

    /// Storage range covering every entry whose composite key starts with the
    /// encoded prefix. An empty prefix covers the whole partition.
    pub fn prefix_range(&self, encoded_prefix: &[u8]) -> BytesRange {
        let lower = self.entry_key(encoded_prefix);
        terminated_prefix_range(lower)
    }
}

impl fmt::Debug for IndexNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexNamespace({})", hex::encode(&self.0))
    }
}

/// Range of every key starting with `lower`, which must end with a
/// terminator: either the namespace's own or the last prefix component's.
fn terminated_prefix_range(lower: Bytes) -> BytesRange {
    match terminated_bytes::prefix_upper_bound(&lower) {
        Some(upper) => BytesRange::new(Bound::Included(lower), Bound::Excluded(upper)),
        None => BytesRange::prefix(lower),
    }
}

/// Value for an index entry: the locator of the indexed record.
///
/// ```text
/// | log_numeric_id (u32 BE) | sequence (u64 BE) |
/// ```
pub struct LocatorValue;

impl LocatorValue {
    pub fn serialize(locator: &Locator) -> Bytes {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(locator.log_numeric_id);
        buf.put_u64(locator.sequence);
        buf.freeze()
    }

    pub fn deserialize(data: &[u8]) -> Result<Locator> {
        if data.len() < 12 {
            return Err(Error::Encoding(format!(
                "buffer too short for locator: need 12 bytes, got {}",
                data.len()
            )));
        }
        let log_numeric_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sequence = u64::from_be_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        Ok(Locator::new(log_numeric_id, sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> KeyComponent {
        KeyComponent::from(value)
    }

    #[test]
    fn should_convert_record_type_to_id_and_back() {
        assert_eq!(RecordType::Cursor.id(), 0x01);
        assert_eq!(RecordType::IndexEntry.id(), 0x02);
        assert_eq!(RecordType::from_id(0x01).unwrap(), RecordType::Cursor);
        assert_eq!(RecordType::from_id(0x02).unwrap(), RecordType::IndexEntry);
        assert!(RecordType::from_id(0x99).is_err());
    }

    #[test]
    fn should_serialize_cursor_key_with_hex_log_id() {
        // given
        let key = CursorKey::new(LogId::from(vec![0xde, 0xad]));

        // when
        let serialized = key.serialize();

        // then
        assert_eq!(serialized.as_ref(), &[0x01, 0x01, b'd', b'e', b'a', b'd']);
        assert_eq!(CursorKey::deserialize(&serialized).unwrap(), key);
        assert!(CursorKey::scan_range().contains(&serialized));
    }

    #[test]
    fn should_reject_cursor_key_with_wrong_record_type() {
        // given
        let data = [KEY_VERSION, RecordType::IndexEntry.id(), b'0', b'0'];

        // when
        let result = CursorKey::deserialize(&data);

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
    }

    #[test]
    fn should_reject_cursor_value_without_numeric_id() {
        // given
        let data = [0x00, 0x01];

        // when
        let result = CursorValue::deserialize(&data);

        // then
        assert!(matches!(result, Err(Error::Encoding(msg)) if msg.contains("numeric id")));
    }

    #[test]
    fn should_serialize_cursor_value() {
        // given
        let value = CursorValue::new(7, 100);

        // when
        let serialized = value.serialize();

        // then
        assert_eq!(serialized.len(), 12);
        assert_eq!(&serialized[0..4], &[0, 0, 0, 7]);
        assert_eq!(CursorValue::deserialize(&serialized).unwrap(), value);
    }

    #[test]
    fn should_serialize_locator_value() {
        // given
        let locator = Locator::new(3, 42);

        // when
        let serialized = LocatorValue::serialize(&locator);

        // then
        assert_eq!(LocatorValue::deserialize(&serialized).unwrap(), locator);
        assert!(LocatorValue::deserialize(&serialized[..8]).is_err());
    }

    #[test]
    fn should_encode_booleans_false_before_true() {
        // given
        let encoder = KeyEncoder::default();

        // when
        let f = encoder.encode(&[KeyComponent::Bool(false)]);
        let t = encoder.encode(&[KeyComponent::Bool(true)]);

        // then
        assert_eq!(f.as_ref(), b"f\x00");
        assert_eq!(t.as_ref(), b"t\x00");
        assert!(f < t);
    }

    #[test]
    fn should_encode_decimal_integers_as_strings() {
        // given
        let encoder = KeyEncoder::new(IntegerEncoding::Decimal);

        // when
        let encoded = encoder.encode(&[KeyComponent::Int(-12)]);

        // then
        assert_eq!(encoded.as_ref(), b"-12\x00");
    }

    #[test]
    fn should_scope_prefix_range_to_matching_components() {
        // given
        let encoder = KeyEncoder::default();
        let namespace = IndexNamespace::new("by-topic");
        let key = |parts: &[KeyComponent]| namespace.entry_key(&encoder.encode(parts));
        let range = namespace.prefix_range(&encoder.encode(&[s("a"), s("x")]));

        // when/then
        assert!(range.contains(&key(&[s("a"), s("x"), KeyComponent::Int(1)])));
        assert!(range.contains(&key(&[s("a"), s("x"), KeyComponent::Int(2)])));
        assert!(range.contains(&key(&[s("a"), s("x")])));
        assert!(!range.contains(&key(&[s("a"), s("y"), KeyComponent::Int(1)])));
        assert!(!range.contains(&key(&[s("b"), s("x"), KeyComponent::Int(1)])));
        assert!(!range.contains(&key(&[s("a"), s("xy")])));
        assert!(!range.contains(&key(&[s("a"), s("x\u{0}")])));
    }

    #[test]
    fn should_isolate_index_namespaces() {
        // given
        let encoder = KeyEncoder::default();
        let short = IndexNamespace::new("idx");
        let long = IndexNamespace::new("idx2");

        // when
        let whole_short = short.prefix_range(&[]);
        let entry_in_long = long.entry_key(&encoder.encode(&[s("a")]));

        // then
        assert!(!whole_short.contains(&entry_in_long));
        assert!(whole_short.contains(&short.entry_key(&encoder.encode(&[s("a")]))));
        assert!(!whole_short.contains(&CursorKey::new(LogId::from("idx")).serialize()));
    }

    #[test]
    fn should_nest_child_namespace_inside_parent() {
        // given
        let encoder = KeyEncoder::default();
        let parent = IndexNamespace::new("by-topic");
        let child = parent.child(&encoder.encode(&[s("a")]));

        // when
        let nested = child.entry_key(&encoder.encode(&[s("x")]));
        let whole_child = child.prefix_range(&[]);

        // then
        assert_eq!(nested, parent.entry_key(&encoder.encode(&[s("a"), s("x")])));
        assert!(parent.prefix_range(&[]).contains(&nested));
        assert!(!whole_child.contains(&parent.entry_key(&encoder.encode(&[s("ab")]))));
        assert!(!whole_child.contains(&parent.entry_key(&encoder.encode(&[s("b")]))));
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn component() -> impl Strategy<Value = KeyComponent> {
            prop_oneof![
                any::<String>().prop_map(KeyComponent::String),
                any::<i64>().prop_map(KeyComponent::Int),
                any::<bool>().prop_map(KeyComponent::Bool),
                any::<Vec<u8>>().prop_map(|b| KeyComponent::Bytes(Bytes::from(b))),
            ]
        }

        proptest! {
            #[test]
            fn should_preserve_integer_ordering(a: i64, b: i64) {
                let encoder = KeyEncoder::default();
                let enc_a = encoder.encode(&[KeyComponent::Int(a)]);
                let enc_b = encoder.encode(&[KeyComponent::Int(b)]);
                prop_assert_eq!(a.cmp(&b), enc_a.cmp(&enc_b));
            }

            #[test]
            fn should_preserve_string_tuple_ordering(
                a: (String, String),
                b: (String, String),
            ) {
                let encoder = KeyEncoder::default();
                let enc_a = encoder.encode(&[s(&a.0), s(&a.1)]);
                let enc_b = encoder.encode(&[s(&b.0), s(&b.1)]);
                prop_assert_eq!(a.cmp(&b), enc_a.cmp(&enc_b));
            }

            #[test]
            fn should_contain_key_iff_it_extends_prefix(
                prefix in prop::collection::vec(component(), 0..3),
                key in prop::collection::vec(component(), 0..5),
            ) {
                let encoder = KeyEncoder::default();
                let namespace = IndexNamespace::new("p");
                let range = namespace.prefix_range(&encoder.encode(&prefix));
                let stored = namespace.entry_key(&encoder.encode(&key));

                let extends = key.len() >= prefix.len()
                    && encoder.encode(&key[..prefix.len()]) == encoder.encode(&prefix);
                prop_assert_eq!(range.contains(&stored), extends);
            }
        }
    }
}
