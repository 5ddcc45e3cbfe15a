//! In-memory storage engine backed by a `BTreeMap`.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, WriteOptions,
};
use crate::BytesRange;

/// Ordered in-memory storage.
///
/// Clones share the same underlying map, so a clone can be handed to a
/// second component (or kept by a test) to observe every write.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    data: Arc<RwLock<BTreeMap<Bytes, Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.read_map().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Storage("storage is closed".to_string()));
        }
        Ok(())
    }

    fn read_map(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<Bytes, Bytes>>> {
        self.data
            .read()
            .map_err(|_| StorageError::Internal("in-memory storage lock poisoned".to_string()))
    }

    fn write_map(
        &self,
    ) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<Bytes, Bytes>>> {
        self.data
            .write()
            .map_err(|_| StorageError::Internal("in-memory storage lock poisoned".to_string()))
    }
}

/// Returns true when `BTreeMap::range` would panic or yield nothing.
fn is_empty_range(range: &BytesRange) -> bool {
    match (range.start(), range.end()) {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}

/// Iterator over a snapshot of the records in a range.
struct InMemoryIterator {
    records: VecDeque<Record>,
}

#[async_trait]
impl StorageIterator for InMemoryIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        Ok(self.records.pop_front())
    }
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        self.check_open()?;
        let map = self.read_map()?;
        Ok(map
            .get(&key)
            .map(|value| Record::new(key.clone(), value.clone())))
    }

    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        self.check_open()?;
        let records = if is_empty_range(&range) {
            VecDeque::new()
        } else {
            let map = self.read_map()?;
            map.range::<Bytes, _>(range)
                .map(|(key, value)| Record::new(key.clone(), value.clone()))
                .collect()
        };
        Ok(Box::new(InMemoryIterator { records }))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        _options: WriteOptions,
    ) -> StorageResult<()> {
        self.check_open()?;
        let mut map = self.write_map()?;
        for record in records {
            map.insert(record.key, record.value);
        }
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.check_open()
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &'static [u8], value: &'static [u8]) -> Record {
        Record::new(Bytes::from_static(key), Bytes::from_static(value))
    }

    #[tokio::test]
    async fn should_get_put_records() {
        // given
        let storage = InMemoryStorage::new();
        storage.put(vec![record(b"k1", b"v1")]).await.unwrap();

        // when
        let found = storage.get(Bytes::from_static(b"k1")).await.unwrap();
        let missing = storage.get(Bytes::from_static(b"k2")).await.unwrap();

        // then
        assert_eq!(found, Some(record(b"k1", b"v1")));
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn should_scan_range_in_key_order() {
        // given
        let storage = InMemoryStorage::new();
        storage
            .put(vec![
                record(b"b", b"2"),
                record(b"a", b"1"),
                record(b"c", b"3"),
                record(b"d", b"4"),
            ])
            .await
            .unwrap();

        // when
        let records = storage
            .scan(BytesRange::new(
                Bound::Included(Bytes::from_static(b"b")),
                Bound::Excluded(Bytes::from_static(b"d")),
            ))
            .await
            .unwrap();

        // then
        assert_eq!(records, vec![record(b"b", b"2"), record(b"c", b"3")]);
    }

    #[tokio::test]
    async fn should_not_observe_writes_after_iterator_created() {
        // given
        let storage = InMemoryStorage::new();
        storage.put(vec![record(b"a", b"1")]).await.unwrap();
        let mut iter = storage.scan_iter(BytesRange::unbounded()).await.unwrap();

        // when
        storage.put(vec![record(b"b", b"2")]).await.unwrap();

        // then
        assert_eq!(iter.next().await.unwrap(), Some(record(b"a", b"1")));
        assert_eq!(iter.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn should_return_empty_for_inverted_range() {
        // given
        let storage = InMemoryStorage::new();
        storage.put(vec![record(b"a", b"1")]).await.unwrap();

        // when
        let records = storage
            .scan(BytesRange::new(
                Bound::Included(Bytes::from_static(b"z")),
                Bound::Excluded(Bytes::from_static(b"a")),
            ))
            .await
            .unwrap();

        // then
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn should_reject_operations_after_close() {
        // given
        let storage = InMemoryStorage::new();

        // when
        storage.close().await.unwrap();
        let result = storage.put(vec![record(b"a", b"1")]).await;

        // then
        assert!(matches!(result, Err(StorageError::Storage(_))));
    }
}
