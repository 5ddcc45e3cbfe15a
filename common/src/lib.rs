pub mod bytes;
pub mod resource;
pub mod serde;
pub mod storage;

pub use bytes::BytesRange;
pub use resource::{Resource, ResourceError, ResourceState};
pub use storage::config::StorageConfig;
pub use storage::factory::{StorageRuntime, create_storage};
pub use storage::in_memory::InMemoryStorage;
pub use storage::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, WriteOptions,
};
