use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use super::{LogSource, SourceItem, SourceStream};
use crate::cursor::CursorLookup;
use crate::error::{Error, Result};
use crate::model::{LogId, Record, Value};

const DEFAULT_BATCH_SIZE: usize = 16;

#[derive(Default)]
struct Logs {
    /// Logs in order of creation.
    order: Vec<LogId>,
    records: HashMap<LogId, Vec<Record>>,
}

struct Inner {
    logs: RwLock<Logs>,
    /// Bumped on every append and on close.
    version: watch::Sender<u64>,
    closed: AtomicBool,
    batch_size: usize,
}

/// In-memory, multi-log [`LogSource`].
///
/// Clones share the same logs. Streams replay each log from the cursor the
/// pipeline persisted, emit [`SourceItem::Sync`] once the logs' initial
/// contents have been delivered, then tail new appends until
/// [`close`](Self::close) is called.
#[derive(Clone)]
pub struct MemoryLogSource {
    inner: Arc<Inner>,
}

impl Default for MemoryLogSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    /// Creates a source delivering at most `batch_size` records per item.
    pub fn with_batch_size(batch_size: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                logs: RwLock::new(Logs::default()),
                version,
                closed: AtomicBool::new(false),
                batch_size: batch_size.max(1),
            }),
        }
    }

    /// Appends a record and returns it with its assigned sequence.
    pub fn append(&self, log_id: impl Into<LogId>, payload: impl Into<Value>) -> Record {
        self.append_with_metadata(log_id, payload, Value::Null)
    }

    pub fn append_with_metadata(
        &self,
        log_id: impl Into<LogId>,
        payload: impl Into<Value>,
        metadata: impl Into<Value>,
    ) -> Record {
        let log_id = log_id.into();
        let record = {
            let mut logs = self.inner.logs.write().unwrap_or_else(PoisonError::into_inner);
            if !logs.records.contains_key(&log_id) {
                logs.order.push(log_id.clone());
            }
            let records = logs.records.entry(log_id.clone()).or_default();
            let record = Record::new(log_id, records.len() as u64, payload)
                .with_metadata(metadata);
            records.push(record.clone());
            record
        };
        self.inner.version.send_modify(|v| *v += 1);
        record
    }

    /// Number of records in `log_id`.
    pub fn len(&self, log_id: &LogId) -> u64 {
        self.read_logs()
            .records
            .get(log_id)
            .map(|r| r.len() as u64)
            .unwrap_or(0)
    }

    /// Ends every stream after the records it has already delivered.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.version.send_modify(|v| *v += 1);
    }

    fn read_logs(&self) -> std::sync::RwLockReadGuard<'_, Logs> {
        self.inner.logs.read().unwrap_or_else(PoisonError::into_inner)
    }
}

struct TailState {
    inner: Arc<Inner>,
    cursors: CursorLookup,
    positions: HashMap<LogId, u64>,
    backlog: Option<HashMap<LogId, u64>>,
    /// Index into `Logs::order` of the log to try first.
    next_log: usize,
    changes: watch::Receiver<u64>,
}

impl TailState {
    async fn next_item(&mut self) -> Option<Result<SourceItem>> {
        loop {
            self.changes.borrow_and_update();
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(backlog) = self.take_drained_backlog() {
                return Some(Ok(SourceItem::Sync(backlog)));
            }
            if let Some(batch) = self.next_batch() {
                return Some(Ok(SourceItem::Records(batch)));
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }

    fn position(&mut self, log_id: &LogId) -> u64 {
        let cursors = &self.cursors;
        *self
            .positions
            .entry(log_id.clone())
            .or_insert_with(|| cursors.resume_sequence(log_id))
    }

    fn take_drained_backlog(&mut self) -> Option<HashMap<LogId, u64>> {
        let backlog = self.backlog.as_ref()?;
        let pending: Vec<(LogId, u64)> = backlog
            .iter()
            .map(|(log_id, len)| (log_id.clone(), *len))
            .collect();
        for (log_id, len) in pending {
            if self.position(&log_id) < len {
                return None;
            }
        }
        self.backlog.take()
    }

    /// Next run of undelivered records, taking logs in turn.
    ///
    /// Until sync fires only the records counted in the backlog are eligible,
    /// so appends made after the stream was created arrive after the marker.
    fn next_batch(&mut self) -> Option<Vec<Record>> {
        let inner = self.inner.clone();
        let logs = inner.logs.read().unwrap_or_else(PoisonError::into_inner);
        let count = logs.order.len();
        for offset in 0..count {
            let index = (self.next_log + offset) % count;
            let log_id = &logs.order[index];
            let limit = match &self.backlog {
                Some(backlog) => match backlog.get(log_id) {
                    Some(len) => *len as usize,
                    None => continue,
                },
                None => usize::MAX,
            };
            let Some(records) = logs.records.get(log_id) else {
                continue;
            };
            let start = self.position(log_id) as usize;
            let end = records.len().min(limit).min(start + inner.batch_size);
            if start < end {
                let batch = records[start..end].to_vec();
                self.positions.insert(log_id.clone(), end as u64);
                self.next_log = (index + 1) % count;
                return Some(batch);
            }
        }
        None
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    fn stream(&self, cursors: CursorLookup) -> SourceStream {
        let backlog = {
            let logs = self.read_logs();
            logs.records
                .iter()
                .map(|(log_id, records)| (log_id.clone(), records.len() as u64))
                .collect()
        };
        let state = TailState {
            inner: self.inner.clone(),
            cursors,
            positions: HashMap::new(),
            backlog: Some(backlog),
            next_log: 0,
            changes: self.inner.version.subscribe(),
        };
        stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })
        .boxed()
    }

    async fn get(&self, log_id: &LogId, sequence: u64) -> Result<Record> {
        self.read_logs()
            .records
            .get(log_id)
            .and_then(|records| records.get(sequence as usize))
            .cloned()
            .ok_or_else(|| {
                Error::Upstream(format!("record {} of log {} not found", sequence, log_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::InMemoryStorage;
    use serde_json::json;

    use super::*;
    use crate::cursor::CursorTable;

    async fn lookup() -> (Arc<CursorTable>, CursorLookup) {
        let table = Arc::new(CursorTable::new(Arc::new(InMemoryStorage::new())));
        table.open().await.unwrap();
        (table.clone(), CursorLookup::new(table))
    }

    async fn next(stream: &mut SourceStream) -> SourceItem {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for source")
            .expect("source ended")
            .expect("source failed")
    }

    fn sequences(item: &SourceItem) -> Vec<(String, u64)> {
        match item {
            SourceItem::Records(records) => records
                .iter()
                .map(|r| (r.log_id.to_hex(), r.sequence))
                .collect(),
            SourceItem::Sync(_) => vec![],
        }
    }

    #[tokio::test]
    async fn should_deliver_backlog_then_sync_then_appends() {
        // given
        let source = MemoryLogSource::with_batch_size(2);
        for i in 0..3 {
            source.append("a", json!({ "i": i }));
        }
        let (_table, cursors) = lookup().await;
        let mut stream = source.stream(cursors);

        // when
        let first = next(&mut stream).await;
        let second = next(&mut stream).await;
        let sync = next(&mut stream).await;
        source.append("b", json!({}));
        let live = next(&mut stream).await;

        // then
        let a = LogId::from("a").to_hex();
        assert_eq!(sequences(&first), vec![(a.clone(), 0), (a.clone(), 1)]);
        assert_eq!(sequences(&second), vec![(a.clone(), 2)]);
        assert_eq!(
            sync,
            SourceItem::Sync(HashMap::from([(LogId::from("a"), 3)]))
        );
        assert_eq!(sequences(&live), vec![(LogId::from("b").to_hex(), 0)]);
    }

    #[tokio::test]
    async fn should_hold_appends_made_after_stream_creation_until_sync() {
        // given
        let source = MemoryLogSource::new();
        for i in 0..3 {
            source.append("a", json!({ "i": i }));
        }
        let (_table, cursors) = lookup().await;
        let mut stream = source.stream(cursors);
        source.append("a", json!({ "i": 3 }));

        // when
        let backlog = next(&mut stream).await;
        let sync = next(&mut stream).await;
        let live = next(&mut stream).await;

        // then
        let a = LogId::from("a").to_hex();
        assert_eq!(
            sequences(&backlog),
            vec![(a.clone(), 0), (a.clone(), 1), (a.clone(), 2)]
        );
        assert_eq!(
            sync,
            SourceItem::Sync(HashMap::from([(LogId::from("a"), 3)]))
        );
        assert_eq!(sequences(&live), vec![(a, 3)]);
    }

    #[tokio::test]
    async fn should_take_logs_in_turn() {
        // given
        let source = MemoryLogSource::with_batch_size(1);
        for i in 0..2 {
            source.append("a", json!({ "i": i }));
            source.append("b", json!({ "i": i }));
        }
        let (_table, cursors) = lookup().await;
        let mut stream = source.stream(cursors);

        // when
        let mut delivered = Vec::new();
        for _ in 0..4 {
            delivered.extend(sequences(&next(&mut stream).await));
        }

        // then
        let a = LogId::from("a").to_hex();
        let b = LogId::from("b").to_hex();
        assert_eq!(
            delivered,
            vec![(a.clone(), 0), (b.clone(), 0), (a, 1), (b, 1)]
        );
        assert!(matches!(next(&mut stream).await, SourceItem::Sync(_)));
    }

    #[tokio::test]
    async fn should_resume_from_cursor() {
        // given
        let source = MemoryLogSource::new();
        for i in 0..5 {
            source.append("a", json!({ "i": i }));
        }
        let (table, cursors) = lookup().await;
        table.set(&LogId::from("a"), 3).await.unwrap();

        // when
        let mut stream = source.stream(cursors);
        let item = next(&mut stream).await;

        // then
        let a = LogId::from("a").to_hex();
        assert_eq!(sequences(&item), vec![(a.clone(), 3), (a, 4)]);
    }

    #[tokio::test]
    async fn should_end_stream_on_close() {
        // given
        let source = MemoryLogSource::new();
        let (_table, cursors) = lookup().await;
        let mut stream = source.stream(cursors);
        assert_eq!(next(&mut stream).await, SourceItem::Sync(HashMap::new()));

        // when
        source.close();

        // then
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn should_get_record_by_sequence() {
        // given
        let source = MemoryLogSource::new();
        let appended = source.append_with_metadata("a", "hello", json!({ "type": "chat" }));

        // when
        let found = source.get(&LogId::from("a"), 0).await.unwrap();
        let missing = source.get(&LogId::from("a"), 1).await;

        // then
        assert_eq!(found, appended);
        assert_eq!(source.len(&LogId::from("a")), 1);
        assert!(matches!(missing, Err(Error::Upstream(_))));
    }
}
