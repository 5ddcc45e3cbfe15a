//! Ordered key-value storage abstraction.
//!
//! Systems built on `common` never talk to a storage engine directly. They
//! hold an `Arc<dyn Storage>` (or `Arc<dyn StorageRead>` for read-only
//! access) created by [`factory::create_storage`], which keeps the engine
//! choice a configuration concern.
//!
//! Keys are compared as raw bytes. Scans return records in ascending key
//! order and observe a snapshot of the store taken when the iterator is
//! created: writes that land after `scan_iter` returns are not visible to
//! that iterator.

pub mod config;
pub mod factory;
pub mod in_memory;
#[cfg(feature = "slatedb")]
pub mod slate;

use async_trait::async_trait;
use bytes::Bytes;

use crate::BytesRange;

/// A key-value pair as stored in the underlying engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Options for write operations.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Whether to wait for the write to be durable before returning.
    ///
    /// Ignored by engines that have no separate durability step (such as the
    /// in-memory engine).
    pub await_durable: bool,
}

/// Error type for storage operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Errors reported by the storage engine, such as I/O failures.
    Storage(String),
    /// Unexpected internal errors that indicate bugs or invariant violations.
    Internal(String),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Iterator over records returned by [`StorageRead::scan_iter`].
#[async_trait]
pub trait StorageIterator {
    /// Returns the next record, or `None` once the range is exhausted.
    async fn next(&mut self) -> StorageResult<Option<Record>>;
}

/// Read operations on an ordered key-value store.
#[async_trait]
pub trait StorageRead: Send + Sync {
    /// Point lookup by exact key.
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>>;

    /// Returns an iterator over all records in `range`, in ascending key order.
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>>;

    /// Collects every record in `range`.
    ///
    /// Only use this for ranges known to be small; prefer [`scan_iter`] for
    /// anything driven by a consumer.
    ///
    /// [`scan_iter`]: StorageRead::scan_iter
    async fn scan(&self, range: BytesRange) -> StorageResult<Vec<Record>> {
        let mut iter = self.scan_iter(range).await?;
        let mut records = Vec::new();
        while let Some(record) = iter.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

/// Read and write operations on an ordered key-value store.
#[async_trait]
pub trait Storage: StorageRead {
    /// Writes a batch of records atomically with default options.
    async fn put(&self, records: Vec<Record>) -> StorageResult<()> {
        self.put_with_options(records, WriteOptions::default())
            .await
    }

    /// Writes a batch of records atomically.
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> StorageResult<()>;

    /// Flushes buffered writes to durable storage.
    async fn flush(&self) -> StorageResult<()>;

    /// Flushes and releases the engine. Further calls fail.
    async fn close(&self) -> StorageResult<()>;
}
