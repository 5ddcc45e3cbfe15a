//! Byte range helpers for ordered key scans.

use std::ops::{Bound, RangeBounds};

use bytes::Bytes;

/// A range over byte-string keys.
///
/// Storage scans take a `BytesRange` rather than a generic `RangeBounds` so
/// that the bounds can be moved into iterators without lifetimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesRange {
    start: Bound<Bytes>,
    end: Bound<Bytes>,
}

impl BytesRange {
    /// Creates a range from explicit bounds.
    pub fn new(start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { start, end }
    }

    /// Creates a range covering every key.
    pub fn unbounded() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Creates a range covering every key that starts with `prefix`.
    ///
    /// The exclusive upper bound is the shortest key greater than every key
    /// with the prefix: the prefix with trailing `0xFF` bytes dropped and the
    /// last remaining byte incremented. A prefix made only of `0xFF` bytes
    /// (or an empty prefix) has no upper bound.
    pub fn prefix(prefix: Bytes) -> Self {
        let end = match prefix_successor(&prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self::new(Bound::Included(prefix), end)
    }

    /// Returns the lower bound.
    pub fn start(&self) -> &Bound<Bytes> {
        &self.start
    }

    /// Returns the upper bound.
    pub fn end(&self) -> &Bound<Bytes> {
        &self.end
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let above_start = match &self.start {
            Bound::Included(start) => key >= start.as_ref(),
            Bound::Excluded(start) => key > start.as_ref(),
            Bound::Unbounded => true,
        };
        let below_end = match &self.end {
            Bound::Included(end) => key <= end.as_ref(),
            Bound::Excluded(end) => key < end.as_ref(),
            Bound::Unbounded => true,
        };
        above_start && below_end
    }
}

impl RangeBounds<Bytes> for BytesRange {
    fn start_bound(&self) -> Bound<&Bytes> {
        self.start.as_ref()
    }

    fn end_bound(&self) -> Bound<&Bytes> {
        self.end.as_ref()
    }
}

fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let last = prefix.iter().rposition(|b| *b != 0xFF)?;
    let mut end = prefix[..=last].to_vec();
    end[last] += 1;
    Some(Bytes::from(end))
}
