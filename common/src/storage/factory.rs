//! Storage factory for creating storage instances from configuration.
//!
//! This module provides factory functions for creating storage backends
//! based on configuration, supporting both InMemory and SlateDB backends.

use std::sync::Arc;

#[cfg(feature = "slatedb")]
use slatedb::DbBuilder;
#[cfg(feature = "slatedb")]
use slatedb::config::Settings;
#[cfg(feature = "slatedb")]
use slatedb::object_store::{self, ObjectStore};
use tokio::runtime::Handle;

#[cfg(feature = "slatedb")]
use super::config::{ObjectStoreConfig, SlateDbStorageConfig};
use super::config::StorageConfig;
use super::in_memory::InMemoryStorage;
#[cfg(feature = "slatedb")]
use super::slate::SlateDbStorage;
use super::{Storage, StorageError, StorageResult};

/// Runtime options for storage that cannot be serialized.
///
/// This struct holds non-serializable runtime configuration like tokio
/// runtime handles. Users can configure these options and pass them to
/// system builders.
#[derive(Default)]
pub struct StorageRuntime {
    pub(crate) compaction_runtime: Option<Handle>,
}

impl StorageRuntime {
    /// Creates a new storage runtime with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a separate runtime for SlateDB compaction tasks.
    ///
    /// When provided, SlateDB's compaction tasks will run on this runtime
    /// instead of the runtime used for user operations.
    ///
    /// This option only affects SlateDB storage; it is ignored for in-memory storage.
    pub fn with_compaction_runtime(mut self, handle: Handle) -> Self {
        self.compaction_runtime = Some(handle);
        self
    }
}

/// Creates an object store from configuration without initializing SlateDB.
#[cfg(feature = "slatedb")]
pub fn create_object_store(config: &ObjectStoreConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        ObjectStoreConfig::InMemory => Ok(Arc::new(object_store::memory::InMemory::new())),
        ObjectStoreConfig::Aws(aws_config) => {
            let store = object_store::aws::AmazonS3Builder::from_env()
                .with_region(&aws_config.region)
                .with_bucket_name(&aws_config.bucket)
                .build()
                .map_err(|e| {
                    StorageError::Storage(format!("Failed to create AWS S3 store: {}", e))
                })?;
            Ok(Arc::new(store))
        }
        ObjectStoreConfig::Local(local_config) => {
            std::fs::create_dir_all(&local_config.path).map_err(|e| {
                StorageError::Storage(format!(
                    "Failed to create storage directory '{}': {}",
                    local_config.path, e
                ))
            })?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(&local_config.path)
                .map_err(|e| {
                    StorageError::Storage(format!(
                        "Failed to create local filesystem store: {}",
                        e
                    ))
                })?;
            Ok(Arc::new(store))
        }
    }
}

/// Creates a storage instance based on configuration and runtime options.
///
/// Returns an `Arc<dyn Storage>` on success, or a `StorageError` on failure.
/// Selecting SlateDB without the `slatedb` feature is a configuration error.
pub async fn create_storage(
    config: &StorageConfig,
    runtime: StorageRuntime,
) -> StorageResult<Arc<dyn Storage>> {
    match config {
        StorageConfig::InMemory => {
            tracing::debug!("creating in-memory storage");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        #[cfg(feature = "slatedb")]
        StorageConfig::SlateDb(slate_config) => {
            let storage = create_slatedb_storage(slate_config, runtime).await?;
            Ok(Arc::new(storage))
        }
        #[cfg(not(feature = "slatedb"))]
        StorageConfig::SlateDb(slate_config) => {
            let _ = runtime;
            Err(StorageError::Storage(format!(
                "SlateDB storage at '{}' requires the `slatedb` feature",
                slate_config.path
            )))
        }
    }
}

#[cfg(feature = "slatedb")]
async fn create_slatedb_storage(
    config: &SlateDbStorageConfig,
    runtime: StorageRuntime,
) -> StorageResult<SlateDbStorage> {
    let object_store = create_object_store(&config.object_store)?;

    let settings = match &config.settings_path {
        Some(path) => Settings::from_file(path).map_err(|e| {
            StorageError::Storage(format!(
                "Failed to load SlateDB settings from {}: {}",
                path, e
            ))
        })?,
        None => Settings::load().unwrap_or_default(),
    };

    let mut db_builder = DbBuilder::new(config.path.clone(), object_store).with_settings(settings);

    if let Some(handle) = runtime.compaction_runtime {
        db_builder = db_builder.with_compaction_runtime(handle);
    }

    tracing::info!(path = %config.path, "opening SlateDB storage");
    let db = db_builder
        .build()
        .await
        .map_err(|e| StorageError::Storage(format!("Failed to create SlateDB: {}", e)))?;

    Ok(SlateDbStorage::new(Arc::new(db)))
}
