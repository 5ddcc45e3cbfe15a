//! Durable, ordered secondary indexes over append-only logs.
//!
//! An [`Indexer`] reads records from a [`LogSource`], derives composite keys
//! for each registered index and stores them in per-index partitions of an
//! ordered key-value store. Consumers query an index by key prefix and can
//! keep receiving newly indexed matches live.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feed_index::{
//!     IndexDefinition, IndexOptions, Indexer, KeyComponent, MemoryLogSource, SubscribeOptions,
//! };
//! use common::InMemoryStorage;
//! use futures::StreamExt;
//!
//! # async fn example() -> feed_index::Result<()> {
//! let source = Arc::new(MemoryLogSource::new());
//! source.append("feed-1", serde_json::json!({ "topic": "news" }));
//!
//! let indexer = Indexer::new(Arc::new(InMemoryStorage::new()), source.clone());
//! indexer.define_index("by-topic", IndexDefinition::fields(["topic"]), IndexOptions::default())?;
//! indexer.open().await?;
//!
//! let mut stream = indexer
//!     .subscribe("by-topic", &[KeyComponent::from("news")], SubscribeOptions::default())
//!     .await?;
//! while let Some(event) = stream.next().await {
//!     println!("{:?}", event?);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod cursor;
mod definition;
mod error;
mod indexer;
mod model;
mod partition;
pub mod serde;
pub mod source;

pub use config::Config;
pub use cursor::{CursorLookup, CursorTable};
pub use definition::{
    FieldPath, IndexDefinition, IndexOptions, KeyReducer, MissingFieldPolicy, tie_break,
};
pub use error::{Error, Result};
pub use indexer::{Indexer, IndexerEvent};
pub use model::{KeyComponent, Locator, LogCursor, LogId, Record, Value};
pub use partition::{
    IndexPartition, IndexStream, LocatorResolver, RecordFilter, StreamEvent, SubscribeOptions,
};
pub use source::{LogSource, MemoryLogSource, SourceItem, SourceStream};
