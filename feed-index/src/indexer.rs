//! The indexing pipeline.
//!
//! [`Indexer`] consumes a [`LogSource`], assigns numeric ids to logs through
//! the cursor table, writes every record into each registered index
//! partition and advances the log's cursor once all of them succeeded.
//!
//! # Lifecycle
//!
//! Indexes are defined while the indexer is idle. `open` loads the cursor
//! table, opens the partitions and spawns a single consuming task. `close`
//! stops the task between source items, releases live subscribers, waits for
//! in-flight writes, then closes partitions and the cursor table. A source
//! error or the source stream ending takes the same path on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use async_trait::async_trait;
use common::{Resource, ResourceState, Storage, StorageRuntime, create_storage};
use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cursor::{CursorLookup, CursorTable};
use crate::definition::{CompiledIndex, IndexDefinition, IndexOptions};
use crate::error::{Error, Result};
use crate::model::{KeyComponent, Locator, LogCursor, LogId, Record};
use crate::partition::{IndexPartition, IndexStream, LocatorResolver, SubscribeOptions};
use crate::serde::KeyEncoder;
use crate::source::{LogSource, SourceItem, SourceStream};

/// Progress and failure notifications published by an [`Indexer`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexerEvent {
    /// Every index has processed the record and its cursor has advanced.
    Indexed(Record),

    /// The indexer has caught up with the backlog the source reported.
    /// Published once.
    Sync,

    /// A fatal error. The indexer closes itself afterwards.
    Error(Error),

    /// One index could not derive a key for one record. Other indexes and
    /// later records are unaffected.
    IndexError {
        index: String,
        record: Record,
        error: Error,
    },
}

struct IndexSlot {
    index: CompiledIndex,
    partition: Arc<IndexPartition>,
}

/// Resolves locators through the cursor table and the log source.
struct SourceResolver {
    cursors: Arc<CursorTable>,
    source: Arc<dyn LogSource>,
}

#[async_trait]
impl LocatorResolver for SourceResolver {
    async fn resolve(&self, locator: Locator) -> Result<Record> {
        let cursor = self
            .cursors
            .get_by_numeric_id(locator.log_numeric_id)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "unknown log numeric id {}",
                    locator.log_numeric_id
                ))
            })?;
        self.source.get(&cursor.log_id, locator.sequence).await
    }
}

struct IndexerInner {
    storage: Arc<dyn Storage>,
    /// Whether the indexer created the store and must close it.
    owns_storage: bool,
    source: Arc<dyn LogSource>,
    resolver: Arc<SourceResolver>,
    config: Config,
    cursors: Arc<CursorTable>,
    indexes: RwLock<Vec<Arc<IndexSlot>>>,
    resource: Resource<Error>,
    events: broadcast::Sender<IndexerEvent>,
    synced: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Builds and maintains secondary indexes over the logs of a [`LogSource`].
///
/// Cloning yields another handle to the same indexer.
#[derive(Clone)]
pub struct Indexer {
    inner: Arc<IndexerInner>,
}

impl Indexer {
    /// Creates an indexer over a caller-owned store, with default options.
    /// The store is left open when the indexer closes.
    pub fn new(storage: Arc<dyn Storage>, source: Arc<dyn LogSource>) -> Self {
        Self::with_config(storage, source, Config::default())
    }

    /// Creates an indexer over a caller-owned store. `config.storage` is
    /// ignored.
    pub fn with_config(
        storage: Arc<dyn Storage>,
        source: Arc<dyn LogSource>,
        config: Config,
    ) -> Self {
        Self::build(storage, false, source, config)
    }

    /// Creates the store described by `config.storage` and an indexer that
    /// closes it on shutdown. Indexes still have to be defined and the
    /// indexer opened.
    pub async fn open_with_config(config: Config, source: Arc<dyn LogSource>) -> Result<Self> {
        let storage = create_storage(&config.storage, StorageRuntime::new()).await?;
        Ok(Self::build(storage, true, source, config))
    }

    fn build(
        storage: Arc<dyn Storage>,
        owns_storage: bool,
        source: Arc<dyn LogSource>,
        config: Config,
    ) -> Self {
        let cursors = Arc::new(CursorTable::new(storage.clone()));
        let resolver = Arc::new(SourceResolver {
            cursors: cursors.clone(),
            source: source.clone(),
        });
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (synced, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(IndexerInner {
                storage,
                owns_storage,
                source,
                resolver,
                config,
                cursors,
                indexes: RwLock::new(Vec::new()),
                resource: Resource::new(),
                events,
                synced,
                shutdown,
                task: StdMutex::new(None),
            }),
        }
    }

    /// Registers an index. Only allowed before the indexer opens.
    pub fn define_index(
        &self,
        name: &str,
        definition: IndexDefinition,
        options: IndexOptions,
    ) -> Result<&Self> {
        let mut indexes = self
            .inner
            .indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.resource.state() != ResourceState::Idle {
            return Err(Error::Configuration(format!(
                "index '{}' can only be defined before the indexer opens",
                name
            )));
        }
        if indexes.iter().any(|slot| slot.index.name() == name) {
            return Err(Error::Configuration(format!(
                "index '{}' already exists",
                name
            )));
        }
        let index = CompiledIndex::compile(name, definition, options)?;
        let partition = Arc::new(IndexPartition::new(
            name,
            self.inner.storage.clone(),
            self.inner.resolver.clone(),
            KeyEncoder::new(self.inner.config.integer_encoding),
            self.inner.config.live_buffer,
        ));
        indexes.push(Arc::new(IndexSlot { index, partition }));
        debug!(index = name, "defined index");
        Ok(self)
    }

    /// Opens the indexer and starts consuming the source. Idempotent.
    pub async fn open(&self) -> Result<()> {
        self.inner.resource.open(|| self.start()).await
    }

    async fn start(&self) -> Result<()> {
        let result = self.start_inner().await;
        if let Err(err) = &result {
            error!(error = %err, "failed to open indexer");
            self.inner.cursors.close().await;
            if self.inner.owns_storage
                && let Err(close_err) = self.inner.storage.close().await
            {
                warn!(error = %close_err, "failed to close storage");
            }
        }
        result
    }

    async fn start_inner(&self) -> Result<()> {
        self.inner.cursors.open().await?;
        let indexes = self.inner.snapshot_indexes();
        for slot in &indexes {
            slot.partition.open().await?;
        }

        let stream = self
            .inner
            .source
            .stream(CursorLookup::new(self.inner.cursors.clone()));
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(consume(self.clone(), indexes, stream, shutdown));
        *self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            indexes = self.inner.snapshot_indexes().len(),
            logs = self.inner.cursors.cursors().len(),
            "indexer opened"
        );
        Ok(())
    }

    /// Stops consuming and releases every partition and the cursor table.
    /// Idempotent; never fails.
    pub async fn close(&self) {
        self.close_with(None).await
    }

    async fn close_with(&self, error: Option<Error>) {
        let inner = &self.inner;
        inner
            .resource
            .close(|| async {
                inner.shutdown.send_replace(true);
                let indexes = inner.snapshot_indexes();
                for slot in &indexes {
                    slot.partition.terminate(error.clone());
                }

                let task = inner
                    .task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(task) = task
                    && let Err(err) = task.await
                {
                    warn!(error = %err, "indexing task did not finish cleanly");
                }

                for slot in &indexes {
                    slot.partition.close(error.clone()).await;
                }
                inner.cursors.close().await;
                if inner.owns_storage
                    && let Err(err) = inner.storage.close().await
                {
                    warn!(error = %err, "failed to close storage");
                }
                info!("indexer closed");
            })
            .await
    }

    pub fn state(&self) -> ResourceState {
        self.inner.resource.state()
    }

    /// Receives every event published after this call.
    pub fn events(&self) -> broadcast::Receiver<IndexerEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until the indexer has caught up with the source's backlog.
    ///
    /// Fails with [`Error::ResourceClosed`] if the indexer closes first.
    pub async fn wait_for_sync(&self) -> Result<()> {
        let mut synced = self.inner.synced.subscribe();
        let mut state = self.inner.resource.watch();
        tokio::select! {
            biased;
            result = synced.wait_for(|synced| *synced) => {
                result.map(|_| ()).map_err(|_| Error::ResourceClosed)
            }
            _ = state.wait_for(|s| matches!(s, ResourceState::Closing | ResourceState::Closed)) => {
                Err(Error::ResourceClosed)
            }
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// The persisted cursor of a log, if the indexer has seen it.
    pub fn cursor(&self, log_id: &LogId) -> Option<LogCursor> {
        self.inner.cursors.get(log_id)
    }

    /// Streams matching records, then follows new ones until dropped or
    /// until the indexer closes.
    pub async fn subscribe(
        &self,
        index_name: &str,
        prefix: &[KeyComponent],
        options: SubscribeOptions,
    ) -> Result<IndexStream> {
        self.stream(index_name, prefix, true, options).await
    }

    /// Streams the records currently matching `prefix`, then ends.
    pub async fn read(
        &self,
        index_name: &str,
        prefix: &[KeyComponent],
        options: SubscribeOptions,
    ) -> Result<IndexStream> {
        self.stream(index_name, prefix, false, options).await
    }

    /// The sub-partition of `index_name` holding the entries whose keys start
    /// with `level`.
    ///
    /// Streams opened on it take prefixes relative to `level`, and entries
    /// added through it reach the index's own subscribers.
    pub fn partition(&self, index_name: &str, level: &[KeyComponent]) -> Result<IndexPartition> {
        Ok(self.open_partition(index_name)?.sub_partition(level))
    }

    async fn stream(
        &self,
        index_name: &str,
        prefix: &[KeyComponent],
        live: bool,
        options: SubscribeOptions,
    ) -> Result<IndexStream> {
        let partition = self.open_partition(index_name)?;
        partition.create_read_stream(prefix, live, options).await
    }

    fn open_partition(&self, index_name: &str) -> Result<Arc<IndexPartition>> {
        match self.state() {
            ResourceState::Open => {}
            ResourceState::Closing | ResourceState::Closed => return Err(Error::ResourceClosed),
            ResourceState::Idle | ResourceState::Opening => {
                return Err(Error::Configuration(
                    "indexer must be open before streaming".to_string(),
                ));
            }
        }
        self.inner
            .snapshot_indexes()
            .iter()
            .find(|slot| slot.index.name() == index_name)
            .map(|slot| slot.partition.clone())
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))
    }
}

impl IndexerInner {
    fn snapshot_indexes(&self) -> Vec<Arc<IndexSlot>> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, event: IndexerEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    /// Indexes a batch of records, then advances their cursors in one write.
    #[tracing::instrument(level = "trace", skip_all, fields(records = records.len()))]
    async fn index_batch(&self, indexes: &[Arc<IndexSlot>], records: Vec<Record>) -> Result<()> {
        let mut advances = Vec::with_capacity(records.len());
        for record in &records {
            let cursor = self.cursors.ensure(&record.log_id).await?;
            let results = join_all(
                indexes
                    .iter()
                    .map(|slot| self.index_record(slot, record, &cursor)),
            )
            .await;
            for result in results {
                result?;
            }
            advances.push((record.log_id.clone(), record.sequence + 1));
        }
        self.cursors.set_many(advances).await?;

        for record in records {
            self.publish(IndexerEvent::Indexed(record));
        }
        Ok(())
    }

    /// Writes one record into one index. Definition failures are reported
    /// as events; storage failures are returned.
    async fn index_record(
        &self,
        slot: &IndexSlot,
        record: &Record,
        cursor: &LogCursor,
    ) -> Result<()> {
        match slot.index.derive(record, cursor) {
            Ok(Some(components)) => {
                let locator = Locator::new(cursor.numeric_id, record.sequence);
                slot.partition.add(&components, locator).await?;
            }
            Ok(None) => {}
            Err(error) => {
                debug!(
                    index = slot.index.name(),
                    log_id = %record.log_id,
                    sequence = record.sequence,
                    error = %error,
                    "failed to derive index key"
                );
                self.publish(IndexerEvent::IndexError {
                    index: slot.index.name().to_string(),
                    record: record.clone(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Drops every log whose cursor reached its backlog length and fires
    /// global sync once none remain.
    async fn check_sync(
        &self,
        indexes: &[Arc<IndexSlot>],
        waiting: &mut Option<HashMap<LogId, u64>>,
    ) {
        let Some(backlog) = waiting else {
            return;
        };
        backlog.retain(|log_id, len| self.cursors.resume_sequence(log_id) < *len);
        if !backlog.is_empty() {
            return;
        }
        *waiting = None;
        if self.synced.send_replace(true) {
            return;
        }
        for slot in indexes {
            slot.partition.mark_synced().await;
        }
        info!("indexer synced");
        self.publish(IndexerEvent::Sync);
    }
}

/// Body of the consuming task.
async fn consume(
    indexer: Indexer,
    indexes: Vec<Arc<IndexSlot>>,
    mut stream: SourceStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let inner = &indexer.inner;
    let mut waiting: Option<HashMap<LogId, u64>> = None;

    let outcome: Result<()> = loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break Ok(()),
            item = stream.next() => item,
        };
        let result = match item {
            None => {
                info!("log source ended");
                break Ok(());
            }
            Some(Err(err)) => Err(err),
            Some(Ok(SourceItem::Records(records))) => inner.index_batch(&indexes, records).await,
            Some(Ok(SourceItem::Sync(backlog))) => {
                if !*inner.synced.borrow() {
                    waiting = Some(backlog);
                }
                Ok(())
            }
        };
        if let Err(err) = result {
            break Err(err);
        }
        inner.check_sync(&indexes, &mut waiting).await;
    };

    if *shutdown.borrow() {
        return;
    }

    let error = match outcome {
        Ok(()) => None,
        Err(err) => {
            error!(error = %err, "indexing failed");
            inner.publish(IndexerEvent::Error(err.clone()));
            Some(err)
        }
    };
    // close() awaits this task, so it has to run elsewhere.
    let indexer = indexer.clone();
    tokio::spawn(async move { indexer.close_with(error).await });
}
