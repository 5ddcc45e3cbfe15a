//! Durable per-log cursors.
//!
//! The cursor table maps each log to a compact numeric id, used in index
//! locators, and to the next sequence the pipeline has to index. Both lookup
//! directions are served from memory; the store is only read once, on open.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use common::{Record as StorageRecord, Resource, Storage};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{LogCursor, LogId};
use crate::serde::{CursorKey, CursorValue};

#[derive(Default)]
struct CursorState {
    /// Arena indexed by numeric id.
    by_numeric_id: Vec<Option<LogCursor>>,
    by_log: HashMap<LogId, u32>,
}

impl CursorState {
    fn get(&self, log_id: &LogId) -> Option<&LogCursor> {
        let id = *self.by_log.get(log_id)?;
        self.by_numeric_id.get(id as usize)?.as_ref()
    }

    fn insert(&mut self, cursor: LogCursor) {
        let idx = cursor.numeric_id as usize;
        if self.by_numeric_id.len() <= idx {
            self.by_numeric_id.resize(idx + 1, None);
        }
        self.by_log.insert(cursor.log_id.clone(), cursor.numeric_id);
        self.by_numeric_id[idx] = Some(cursor);
    }

    fn next_numeric_id(&self) -> usize {
        self.by_numeric_id.len()
    }
}

/// Durable mapping from log id to [`LogCursor`].
pub struct CursorTable {
    storage: Arc<dyn Storage>,
    resource: Resource<Error>,
    state: RwLock<CursorState>,
    /// Serializes writers so numeric id assignment and persistence happen
    /// in one step. Readers never take it.
    write_lock: Mutex<()>,
}

impl CursorTable {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            resource: Resource::new(),
            state: RwLock::new(CursorState::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Loads every persisted cursor into memory. Runs once.
    pub async fn open(&self) -> Result<()> {
        self.resource.open(|| self.load()).await
    }

    /// Flushes the store and marks the table closed.
    pub async fn close(&self) {
        self.resource
            .close(|| async {
                if let Err(err) = self.storage.flush().await {
                    warn!(error = %err, "failed to flush cursor table on close");
                }
            })
            .await
    }

    pub fn is_open(&self) -> bool {
        self.resource.is_open()
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn load(&self) -> Result<()> {
        let mut iter = self.storage.scan_iter(CursorKey::scan_range()).await?;
        let mut state = CursorState::default();
        while let Some(record) = iter.next().await? {
            let key = CursorKey::deserialize(&record.key)?;
            let value = CursorValue::deserialize(&record.value)?;
            if let Some(existing) = state.by_numeric_id.get(value.numeric_id as usize)
                && existing.is_some()
            {
                return Err(Error::Encoding(format!(
                    "numeric id {} assigned to more than one log",
                    value.numeric_id
                )));
            }
            state.insert(LogCursor {
                log_id: key.log_id,
                numeric_id: value.numeric_id,
                next_sequence: value.next_sequence,
            });
        }
        debug!(logs = state.by_log.len(), "loaded cursor table");
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    pub fn get(&self, log_id: &LogId) -> Option<LogCursor> {
        self.read_state().get(log_id).cloned()
    }

    pub fn get_by_numeric_id(&self, numeric_id: u32) -> Option<LogCursor> {
        self.read_state()
            .by_numeric_id
            .get(numeric_id as usize)
            .and_then(|cursor| cursor.clone())
    }

    /// Sequence the log source should resume `log_id` from.
    pub fn resume_sequence(&self, log_id: &LogId) -> u64 {
        self.get(log_id).map(|c| c.next_sequence).unwrap_or(0)
    }

    /// Every known cursor, ordered by numeric id.
    pub fn cursors(&self) -> Vec<LogCursor> {
        self.read_state()
            .by_numeric_id
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Returns the cursor for `log_id`, assigning a numeric id and persisting
    /// an initial cursor if the log is unseen.
    pub async fn ensure(&self, log_id: &LogId) -> Result<LogCursor> {
        if let Some(cursor) = self.get(log_id) {
            return Ok(cursor);
        }
        self.set_many(vec![(log_id.clone(), 0)]).await?;
        self.get(log_id)
            .ok_or_else(|| Error::Internal(format!("cursor for {} was not stored", log_id)))
    }

    /// Advances the cursor of one log. See [`set_many`](Self::set_many).
    pub async fn set(&self, log_id: &LogId, next_sequence: u64) -> Result<LogCursor> {
        self.set_many(vec![(log_id.clone(), next_sequence)]).await?;
        self.get(log_id)
            .ok_or_else(|| Error::Internal(format!("cursor for {} was not stored", log_id)))
    }

    /// Advances several cursors with one storage write.
    ///
    /// Unseen logs get the next numeric ids in update order. A cursor never
    /// moves backwards: updates below the current `next_sequence` are ignored.
    /// The in-memory state changes only after the write succeeds, so readers
    /// observe either every update or none.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn set_many(&self, updates: Vec<(LogId, u64)>) -> Result<()> {
        self.resource.ensure_open()?;
        let _guard = self.write_lock.lock().await;

        let mut staged: Vec<LogCursor> = Vec::new();
        {
            let state = self.read_state();
            let mut next_id = state.next_numeric_id();
            for (log_id, next_sequence) in updates {
                if let Some(pending) = staged.iter_mut().find(|c| c.log_id == log_id) {
                    pending.next_sequence = pending.next_sequence.max(next_sequence);
                    continue;
                }
                match state.get(&log_id) {
                    Some(current) if current.next_sequence >= next_sequence => {}
                    Some(current) => staged.push(LogCursor {
                        next_sequence,
                        ..current.clone()
                    }),
                    None => {
                        let numeric_id = u32::try_from(next_id).map_err(|_| {
                            Error::Internal("numeric log id space exhausted".to_string())
                        })?;
                        next_id += 1;
                        debug!(log_id = %log_id, numeric_id, "assigned numeric id");
                        staged.push(LogCursor {
                            log_id,
                            numeric_id,
                            next_sequence,
                        });
                    }
                }
            }
        }

        if staged.is_empty() {
            return Ok(());
        }

        let records = staged
            .iter()
            .map(|cursor| {
                StorageRecord::new(
                    CursorKey::new(cursor.log_id.clone()).serialize(),
                    CursorValue::new(cursor.numeric_id, cursor.next_sequence).serialize(),
                )
            })
            .collect();
        self.storage.put(records).await?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for cursor in staged {
            state.insert(cursor);
        }
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, CursorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only view of the cursor table handed to the log source, so it can
/// resume each log where indexing left off.
#[derive(Clone)]
pub struct CursorLookup {
    table: Arc<CursorTable>,
}

impl CursorLookup {
    pub(crate) fn new(table: Arc<CursorTable>) -> Self {
        Self { table }
    }

    /// First sequence of `log_id` that has not been indexed yet.
    pub fn resume_sequence(&self, log_id: &LogId) -> u64 {
        self.table.resume_sequence(log_id)
    }

    /// Every log the pipeline has seen, ordered by numeric id.
    pub fn known_logs(&self) -> Vec<LogCursor> {
        self.table.cursors()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use common::InMemoryStorage;

    use super::*;

    async fn open_table(storage: &InMemoryStorage) -> CursorTable {
        let table = CursorTable::new(Arc::new(storage.clone()));
        table.open().await.unwrap();
        table
    }

    #[tokio::test]
    async fn should_assign_numeric_ids_in_order_of_first_sight() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;

        // when
        let a = table.ensure(&LogId::from("a")).await.unwrap();
        let b = table.ensure(&LogId::from("b")).await.unwrap();
        let a_again = table.ensure(&LogId::from("a")).await.unwrap();

        // then
        assert_eq!(a.numeric_id, 0);
        assert_eq!(b.numeric_id, 1);
        assert_eq!(a_again, a);
        assert_eq!(a.next_sequence, 0);
    }

    #[tokio::test]
    async fn should_look_up_by_numeric_id() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;
        table.set(&LogId::from("a"), 5).await.unwrap();

        // when
        let cursor = table.get_by_numeric_id(0);

        // then
        assert_eq!(
            cursor,
            Some(LogCursor {
                log_id: LogId::from("a"),
                numeric_id: 0,
                next_sequence: 5,
            })
        );
        assert_eq!(table.get_by_numeric_id(1), None);
    }

    #[tokio::test]
    async fn should_never_move_cursor_backwards() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;
        table.set(&LogId::from("a"), 10).await.unwrap();

        // when
        let cursor = table.set(&LogId::from("a"), 3).await.unwrap();

        // then
        assert_eq!(cursor.next_sequence, 10);
    }

    #[tokio::test]
    async fn should_coalesce_updates_for_same_log() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;

        // when
        table
            .set_many(vec![
                (LogId::from("a"), 1),
                (LogId::from("b"), 1),
                (LogId::from("a"), 2),
            ])
            .await
            .unwrap();

        // then
        assert_eq!(table.resume_sequence(&LogId::from("a")), 2);
        assert_eq!(table.get(&LogId::from("b")).unwrap().numeric_id, 1);
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn should_reload_cursors_on_open() {
        // given
        let storage = InMemoryStorage::new();
        {
            let table = open_table(&storage).await;
            table.set(&LogId::from("a"), 7).await.unwrap();
            table.set(&LogId::from("b"), 3).await.unwrap();
            table.close().await;
        }

        // when
        let table = open_table(&storage).await;
        let c = table.ensure(&LogId::from("c")).await.unwrap();

        // then
        assert_eq!(table.resume_sequence(&LogId::from("a")), 7);
        assert_eq!(table.get(&LogId::from("b")).unwrap().numeric_id, 1);
        assert_eq!(c.numeric_id, 2);
        assert_eq!(table.cursors().len(), 3);
    }

    #[tokio::test]
    async fn should_reject_entry_without_numeric_id() {
        // given
        let storage = InMemoryStorage::new();
        storage
            .put(vec![StorageRecord::new(
                CursorKey::new(LogId::from("a")).serialize(),
                Bytes::from_static(&[0x00]),
            )])
            .await
            .unwrap();
        let table = CursorTable::new(Arc::new(storage));

        // when
        let result = table.open().await;

        // then
        assert!(matches!(result, Err(Error::Encoding(_))));
        assert!(!table.is_open());
    }

    #[tokio::test]
    async fn should_not_publish_cursor_when_write_fails() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;
        storage.close().await.unwrap();

        // when
        let result = table.ensure(&LogId::from("a")).await;

        // then
        assert!(matches!(result, Err(Error::Upstream(_))));
        assert_eq!(table.get(&LogId::from("a")), None);
        assert!(table.cursors().is_empty());
    }

    #[tokio::test]
    async fn should_reject_writes_after_close() {
        // given
        let storage = InMemoryStorage::new();
        let table = open_table(&storage).await;

        // when
        table.close().await;
        let result = table.set(&LogId::from("a"), 1).await;

        // then
        assert_eq!(result, Err(Error::ResourceClosed));
    }
}
