mod persistent_store;
mod persistent_store_cache;
mod persistent_store_wrapper;
mod status;
mod store;
pub(crate) mod store_types;

pub use persistent_store::{PersistentDataStore, PersistentStoreError};
pub use persistent_store_cache::{CacheMode, DEFAULT_CACHE_TTL};
pub use persistent_store_wrapper::PersistentDataStoreWrapper;
pub use status::{DataStoreStatus, DataStoreStatusProvider};
pub use store::{DataStore, DataStoreError, InMemoryDataStore};
pub use store_types::{
    all_data_from, AllData, Collection, DataKind, Item, ItemDescriptor, SerializedCollection,
    SerializedItem, ALL_KINDS, FEATURES, SEGMENTS,
};
pub(crate) use store_types::decode_all_data;
