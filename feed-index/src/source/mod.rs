//! Log sources: where the pipeline reads records from.
//!
//! The log storage itself is external. The pipeline only needs an ordered,
//! resumable stream of records plus point lookups by `(log, sequence)` to
//! resolve index locators.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use memory::MemoryLogSource;

use crate::cursor::CursorLookup;
use crate::error::Result;
use crate::model::{LogId, Record};

/// An item delivered by a [`LogSource`] stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceItem {
    /// One or more records, in per-log sequence order.
    Records(Vec<Record>),

    /// The historical backlog has been delivered. Carries each known log's
    /// length at the time the stream started; the pipeline is caught up once
    /// every log's cursor reaches its length.
    Sync(HashMap<LogId, u64>),
}

pub type SourceStream = BoxStream<'static, Result<SourceItem>>;

/// Collaborator providing the records to index.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Streams records from every log, starting each log at the sequence
    /// returned by `cursors`. The stream should emit [`SourceItem::Sync`]
    /// once, after the backlog that existed when it started.
    ///
    /// Ending the stream closes the pipeline.
    fn stream(&self, cursors: CursorLookup) -> SourceStream;

    /// Reads one record.
    async fn get(&self, log_id: &LogId, sequence: u64) -> Result<Record>;
}
