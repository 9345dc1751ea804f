use std::error::Error as StdError;

use thiserror::Error;

use super::store_types::{DataKind, SerializedCollection, SerializedItem};

/// Error type returned by [PersistentDataStore] implementations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PersistentStoreError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl PersistentStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// PersistentDataStore is the contract for a database integration such as Redis or DynamoDB.
///
/// Implementations deal only in serialized items; caching, deserialization and outage
/// detection are provided by [crate::stores::PersistentDataStoreWrapper]. An implementation
/// may be shared by several SDK instances, so it must never assume it is the only writer.
pub trait PersistentDataStore: Send + Sync {
    /// Overwrites the store's contents with the given collections, removing anything not
    /// present in them, and records that the store has been initialized.
    ///
    /// Collections arrive ordered so that an item's dependencies precede it. A store that cannot
    /// replace everything atomically should write in the given order.
    fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), PersistentStoreError>;

    /// Retrieves an item, including a deleted placeholder if that is what is stored.
    fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<SerializedItem>, PersistentStoreError>;

    /// Retrieves every item of a kind, including deleted placeholders.
    fn all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, PersistentStoreError>;

    /// Writes an item only if its version is higher than the stored version, returning whether
    /// the write happened. This must be atomic with respect to other writers: stores with a
    /// version column should use a conditional write, and stores that can only see the
    /// serialized bytes should re-read after writing and retry if another writer won.
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, PersistentStoreError>;

    /// True if any SDK instance has ever initialized this store.
    fn is_initialized(&self) -> bool;

    /// A cheap health check, polled while the store is believed to be failing.
    fn is_store_available(&self) -> bool;

    fn close(&self) -> Result<(), PersistentStoreError> {
        Ok(())
    }
}
