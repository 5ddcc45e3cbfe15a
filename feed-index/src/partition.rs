//! Index partitions: one ordered namespace of entries per index, optionally
//! split into nested sub-partitions per leading key component.
//!
//! A partition stores each entry as `namespace ++ encoded key -> locator`
//! and serves prefix queries as a historical scan optionally followed by a
//! live tail of entries added afterwards.
//!
//! # Live delivery
//!
//! Every live stream registers a bounded channel together with the storage
//! range it covers. [`IndexPartition::add`] writes the entry and then sends
//! it to every stream whose range contains the key, waiting for channel
//! capacity. Writes and stream registration share one lock, and each write
//! bumps a counter; a stream remembers the counter value at the moment its
//! scan snapshot was taken and drops live entries the snapshot already
//! contains.
//!
//! The pipeline's global sync is queued into every live channel as a marker,
//! so a stream emits [`StreamEvent::Sync`] only after its historical scan is
//! drained and after every entry written before the sync.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use common::{BytesRange, Record as StorageRecord, Resource, Storage, StorageIterator};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{KeyComponent, Locator, Record};
use crate::serde::{IndexNamespace, KeyEncoder, LocatorValue};

/// Resolves a stored locator back into the record it points at.
#[async_trait]
pub trait LocatorResolver: Send + Sync {
    async fn resolve(&self, locator: Locator) -> Result<Record>;
}

/// Asynchronous predicate applied to resolved records before they are
/// yielded. Records for which it returns `false` are dropped.
pub type RecordFilter = Arc<dyn Fn(&Record) -> BoxFuture<'static, bool> + Send + Sync>;

/// Options for index streams.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<RecordFilter>,
}

impl SubscribeOptions {
    pub fn with_filter<F, Fut>(filter: F) -> Self
    where
        F: Fn(&Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            filter: Some(Arc::new(move |record: &Record| filter(record).boxed())),
        }
    }
}

/// An item produced by an index stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Record(Record),
    /// The stream has delivered all historical entries and the pipeline has
    /// caught up with every log. Emitted at most once, by live streams only.
    Sync,
}

#[derive(Debug)]
enum LiveMessage {
    Entry { seq: u64, locator: Locator },
    Sync,
}

struct LiveSubscriber {
    range: BytesRange,
    tx: mpsc::Sender<LiveMessage>,
}

#[derive(Default)]
struct LiveRegistry {
    /// Number of entries written so far.
    written_seq: u64,
    synced: bool,
    subscribers: Vec<LiveSubscriber>,
}

#[derive(Debug, Clone)]
struct Termination {
    error: Option<Error>,
}

/// State shared by an index partition and all of its sub-partitions.
struct PartitionShared {
    name: String,
    encoder: KeyEncoder,
    storage: Arc<dyn Storage>,
    resolver: Arc<dyn LocatorResolver>,
    resource: Resource<Error>,
    live: Mutex<LiveRegistry>,
    terminated: watch::Sender<Option<Termination>>,
    live_buffer: usize,
}

/// A named, ordered set of index entries.
///
/// [`sub_partition`](Self::sub_partition) narrows a partition to one prefix
/// level. Levels share storage, lifecycle and live subscribers, so an entry
/// added at any level reaches every live stream whose range contains it.
pub struct IndexPartition {
    shared: Arc<PartitionShared>,
    namespace: IndexNamespace,
    /// Components leading every key of this level; empty for the index itself.
    level: Vec<KeyComponent>,
}

impl IndexPartition {
    pub fn new(
        name: &str,
        storage: Arc<dyn Storage>,
        resolver: Arc<dyn LocatorResolver>,
        encoder: KeyEncoder,
        live_buffer: usize,
    ) -> Self {
        let (terminated, _) = watch::channel(None);
        Self {
            shared: Arc::new(PartitionShared {
                name: name.to_string(),
                encoder,
                storage,
                resolver,
                resource: Resource::new(),
                live: Mutex::new(LiveRegistry::default()),
                terminated,
                live_buffer: live_buffer.max(1),
            }),
            namespace: IndexNamespace::new(name),
            level: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Leading components of this level.
    pub fn level(&self) -> &[KeyComponent] {
        &self.level
    }

    /// Partition holding the entries whose keys start with `leading`, with
    /// keys and prefixes relative to it.
    pub fn sub_partition(&self, leading: &[KeyComponent]) -> IndexPartition {
        let mut level = self.level.clone();
        level.extend_from_slice(leading);
        IndexPartition {
            shared: self.shared.clone(),
            namespace: self.namespace.child(&self.shared.encoder.encode(leading)),
            level,
        }
    }

    pub async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        shared
            .resource
            .open(|| async {
                debug!(index = %shared.name, "opened partition");
                Ok(())
            })
            .await
    }

    /// Ends every open stream, yielding `error` to each one first if given.
    ///
    /// Writers blocked on a full live channel are released. Safe to call more
    /// than once; only the first error is kept.
    pub fn terminate(&self, error: Option<Error>) {
        self.shared.terminated.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(Termination { error });
            true
        });
    }

    /// Terminates all streams and marks the partition closed, at every level.
    pub async fn close(&self, error: Option<Error>) {
        self.terminate(error);
        let shared = &self.shared;
        shared
            .resource
            .close(|| async {
                shared.live.lock().await.subscribers.clear();
                debug!(index = %shared.name, "closed partition");
            })
            .await;
    }

    /// Adds an entry unless one with the same key already exists.
    ///
    /// Returns `true` if a new entry was written. An existing entry keeps its
    /// original locator.
    #[tracing::instrument(level = "trace", skip_all, fields(index = %self.shared.name))]
    pub async fn add(&self, components: &[KeyComponent], locator: Locator) -> Result<bool> {
        let shared = &self.shared;
        shared.resource.ensure_open()?;
        let key = self.namespace.entry_key(&shared.encoder.encode(components));

        let (seq, targets) = {
            let mut registry = shared.live.lock().await;
            if shared.storage.get(key.clone()).await?.is_some() {
                return Ok(false);
            }
            shared
                .storage
                .put(vec![StorageRecord::new(
                    key.clone(),
                    LocatorValue::serialize(&locator),
                )])
                .await?;
            registry.written_seq += 1;
            registry.subscribers.retain(|s| !s.tx.is_closed());
            let targets: Vec<_> = registry
                .subscribers
                .iter()
                .filter(|s| s.range.contains(&key))
                .map(|s| s.tx.clone())
                .collect();
            (registry.written_seq, targets)
        };

        for tx in targets {
            self.deliver(tx, LiveMessage::Entry { seq, locator }).await;
        }
        Ok(true)
    }

    /// Delivers the pipeline's global sync to every live stream.
    pub async fn mark_synced(&self) {
        let targets: Vec<_> = {
            let mut registry = self.shared.live.lock().await;
            if registry.synced {
                return;
            }
            registry.synced = true;
            registry.subscribers.retain(|s| !s.tx.is_closed());
            registry.subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        for tx in targets {
            self.deliver(tx, LiveMessage::Sync).await;
        }
    }

    /// Waits for channel capacity, giving up if the partition terminates.
    async fn deliver(&self, tx: mpsc::Sender<LiveMessage>, message: LiveMessage) {
        let mut terminated = self.shared.terminated.subscribe();
        tokio::select! {
            _ = tx.send(message) => {}
            _ = terminated.wait_for(Option::is_some) => {}
        }
    }

    /// Streams every record whose key starts with `prefix`, in key order.
    ///
    /// With `live`, the stream then follows entries added later and ends
    /// only when dropped or when the partition closes.
    #[tracing::instrument(level = "trace", skip_all, fields(index = %self.shared.name))]
    pub async fn create_read_stream(
        &self,
        prefix: &[KeyComponent],
        live: bool,
        options: SubscribeOptions,
    ) -> Result<IndexStream> {
        let shared = &self.shared;
        shared.resource.ensure_open()?;
        let range = self.namespace.prefix_range(&shared.encoder.encode(prefix));

        let (history, live_rx, snapshot_seq, sync_after_history) = {
            let mut registry = shared.live.lock().await;
            if shared.terminated.borrow().is_some() {
                return Err(Error::ResourceClosed);
            }
            let history = shared.storage.scan_iter(range.clone()).await?;
            let live_rx = if live {
                let (tx, rx) = mpsc::channel(shared.live_buffer);
                registry.subscribers.push(LiveSubscriber { range, tx });
                Some(rx)
            } else {
                None
            };
            (history, live_rx, registry.written_seq, live && registry.synced)
        };

        let state = StreamState {
            phase: Phase::History,
            history,
            live: live_rx,
            snapshot_seq,
            sync_after_history,
            synced: false,
            resolver: shared.resolver.clone(),
            filter: options.filter,
            terminated: shared.terminated.subscribe(),
        };
        let inner = stream::unfold(state, |mut state| async move {
            let event = state.next_event().await?;
            Some((event, state))
        })
        .boxed();
        Ok(IndexStream { inner })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    History,
    Live,
    Done,
}

struct StreamState {
    phase: Phase,
    history: Box<dyn StorageIterator + Send + 'static>,
    live: Option<mpsc::Receiver<LiveMessage>>,
    snapshot_seq: u64,
    sync_after_history: bool,
    synced: bool,
    resolver: Arc<dyn LocatorResolver>,
    filter: Option<RecordFilter>,
    terminated: watch::Receiver<Option<Termination>>,
}

impl StreamState {
    async fn next_event(&mut self) -> Option<Result<StreamEvent>> {
        loop {
            match self.phase {
                Phase::Done => return None,
                Phase::History => {
                    if let Some(termination) = self.termination() {
                        return self.finish(termination);
                    }
                    match self.history.next().await {
                        Ok(Some(entry)) => match self.resolve_entry(&entry.value).await {
                            Ok(Some(record)) => return Some(Ok(StreamEvent::Record(record))),
                            Ok(None) => {}
                            Err(err) => return self.fail(err),
                        },
                        Ok(None) => {
                            self.phase = if self.live.is_some() {
                                Phase::Live
                            } else {
                                Phase::Done
                            };
                            if self.sync_after_history && !self.synced {
                                self.synced = true;
                                return Some(Ok(StreamEvent::Sync));
                            }
                        }
                        Err(err) => return self.fail(err.into()),
                    }
                }
                Phase::Live => {
                    let Some(live) = self.live.as_mut() else {
                        self.phase = Phase::Done;
                        continue;
                    };
                    let message = tokio::select! {
                        message = live.recv() => message,
                        _ = self.terminated.wait_for(Option::is_some) => None,
                    };
                    match message {
                        Some(LiveMessage::Sync) => {
                            if !self.synced {
                                self.synced = true;
                                return Some(Ok(StreamEvent::Sync));
                            }
                        }
                        Some(LiveMessage::Entry { seq, locator }) => {
                            if seq <= self.snapshot_seq {
                                continue;
                            }
                            match self.resolve(locator).await {
                                Ok(Some(record)) => {
                                    return Some(Ok(StreamEvent::Record(record)));
                                }
                                Ok(None) => {}
                                Err(err) => return self.fail(err),
                            }
                        }
                        None => {
                            let termination = self
                                .termination()
                                .unwrap_or(Termination { error: None });
                            return self.finish(termination);
                        }
                    }
                }
            }
        }
    }

    fn termination(&self) -> Option<Termination> {
        self.terminated.borrow().clone()
    }

    fn finish(&mut self, termination: Termination) -> Option<Result<StreamEvent>> {
        self.phase = Phase::Done;
        self.live = None;
        termination.error.map(Err)
    }

    fn fail(&mut self, err: Error) -> Option<Result<StreamEvent>> {
        self.phase = Phase::Done;
        self.live = None;
        Some(Err(err))
    }

    async fn resolve_entry(&mut self, value: &Bytes) -> Result<Option<Record>> {
        let locator = LocatorValue::deserialize(value)?;
        self.resolve(locator).await
    }

    async fn resolve(&mut self, locator: Locator) -> Result<Option<Record>> {
        let record = self.resolver.resolve(locator).await?;
        if let Some(filter) = &self.filter
            && !filter(&record).await
        {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

/// Stream of records matching an index prefix.
///
/// Dropping the stream cancels it: no further entries are resolved, and the
/// partition stops delivering to it.
pub struct IndexStream {
    inner: BoxStream<'static, Result<StreamEvent>>,
}

impl IndexStream {
    /// Collects the records of a non-live stream, ignoring sync markers.
    pub async fn collect_records(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(event) = self.next().await {
            if let StreamEvent::Record(record) = event? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl Stream for IndexStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
