//! Configuration for the indexing pipeline.

use common::StorageConfig;
use serde::{Deserialize, Serialize};

use crate::serde::IntegerEncoding;

/// Configuration used by [`Indexer::open_with_config`](crate::Indexer::open_with_config).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use feed_index::Config;
///
/// let config: Config = serde_json::from_str(r#"{ "live_buffer": 8 }"#).unwrap();
/// assert_eq!(config.live_buffer, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage engine holding cursors and index entries.
    pub storage: StorageConfig,

    /// Capacity of each live subscription's channel. When a subscriber falls
    /// this far behind, the pipeline waits for it before indexing further.
    pub live_buffer: usize,

    /// Capacity of the pipeline event channel. Slow event receivers observe
    /// a lag rather than blocking the pipeline.
    pub event_capacity: usize,

    /// Encoding of integer key components. Changing this for an existing
    /// store makes previously written entries sort inconsistently.
    pub integer_encoding: IntegerEncoding,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            live_buffer: 64,
            event_capacity: 1024,
            integer_encoding: IntegerEncoding::default(),
        }
    }
}
