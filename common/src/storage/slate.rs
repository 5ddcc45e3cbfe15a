//! SlateDB storage engine.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use slatedb::config::WriteOptions as SlateWriteOptions;
use slatedb::{Db, DbIterator, WriteBatch};

use super::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, WriteOptions,
};
use crate::BytesRange;

fn storage_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Storage(err.to_string())
}

/// Storage backed by a SlateDB database.
pub struct SlateDbStorage {
    db: Arc<Db>,
}

impl SlateDbStorage {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

struct SlateDbIterator {
    inner: DbIterator,
}

#[async_trait]
impl StorageIterator for SlateDbIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        let next = self.inner.next().await.map_err(storage_error)?;
        Ok(next.map(|kv| Record::new(kv.key, kv.value)))
    }
}

#[async_trait]
impl StorageRead for SlateDbStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let value = self.db.get(&key).await.map_err(storage_error)?;
        Ok(value.map(|value| Record::new(key, value)))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + 'static>> {
        let inner = self.db.scan(range).await.map_err(storage_error)?;
        Ok(Box::new(SlateDbIterator { inner }))
    }
}

#[async_trait]
impl Storage for SlateDbStorage {
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for record in &records {
            batch.put(&record.key, &record.value);
        }
        let options = SlateWriteOptions {
            await_durable: options.await_durable,
            ..Default::default()
        };
        self.db
            .write_with_options(batch, &options)
            .await
            .map_err(storage_error)
    }

    async fn flush(&self) -> StorageResult<()> {
        self.db.flush().await.map_err(storage_error)
    }

    async fn close(&self) -> StorageResult<()> {
        self.db.close().await.map_err(storage_error)
    }
}
