//! Serializable storage configuration.

use serde::{Deserialize, Serialize};

/// Selects and configures the storage engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Volatile in-memory storage. Everything is lost when the process exits.
    #[default]
    InMemory,
    /// SlateDB on top of an object store. Requires the `slatedb` feature.
    SlateDb(SlateDbStorageConfig),
}

/// Configuration for the SlateDB engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlateDbStorageConfig {
    /// Path of the database inside the object store.
    pub path: String,
    /// Object store holding the database files.
    pub object_store: ObjectStoreConfig,
    /// Optional SlateDB settings file. Defaults are used when absent.
    #[serde(default)]
    pub settings_path: Option<String>,
}

/// Object store backing a SlateDB database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObjectStoreConfig {
    InMemory,
    Aws(AwsObjectStoreConfig),
    Local(LocalObjectStoreConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsObjectStoreConfig {
    pub region: String,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectStoreConfig {
    pub path: String,
}
