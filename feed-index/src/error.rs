//! Error types for feed index operations.
//!
//! This module defines [`Error`], the error type shared by the cursor table,
//! partitions, index definitions and the indexing pipeline, along with a
//! [`Result`] type alias.

use common::{ResourceError, StorageError};

/// Error type for feed index operations.
///
/// # Error Categories
///
/// - [`Configuration`](Error::Configuration): invalid index registration, such
///   as a duplicate name, a malformed field path, or registering after open.
///   Returned immediately to the caller.
/// - [`ResourceClosed`](Error::ResourceClosed): the component was closed and
///   can no longer be used.
/// - [`MissingField`](Error::MissingField): a field-path index could not
///   resolve a field on a record. Scoped to one (record, index) pair and
///   reported through [`IndexerEvent::IndexError`](crate::IndexerEvent::IndexError).
/// - [`IndexNotFound`](Error::IndexNotFound): a subscription named an index
///   that was never defined.
/// - [`Upstream`](Error::Upstream): the log source or the store failed. Fatal
///   while consuming: the pipeline closes itself.
/// - [`Encoding`](Error::Encoding): persisted bytes could not be decoded.
/// - [`InvalidInput`](Error::InvalidInput): a value cannot be used as a key
///   component.
/// - [`Internal`](Error::Internal): a broken invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Configuration(String),

    ResourceClosed,

    MissingField { index: String, field: String },

    IndexNotFound(String),

    Upstream(String),

    Encoding(String),

    InvalidInput(String),

    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Error::ResourceClosed => write!(f, "Resource is closed"),
            Error::MissingField { index, field } => {
                write!(f, "Missing field '{}' for index '{}'", field, index)
            }
            Error::IndexNotFound(name) => write!(f, "Index not found: {}", name),
            Error::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Storage(msg) => Error::Upstream(msg),
            StorageError::Internal(msg) => Error::Internal(msg),
        }
    }
}

impl From<ResourceError> for Error {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Closed => Error::ResourceClosed,
        }
    }
}

/// Result type alias for feed index operations.
pub type Result<T> = std::result::Result<T, Error>;
