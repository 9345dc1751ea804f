use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use super::persistent_store::PersistentStoreError;
use super::store_types::{AllData, DataKind, ItemDescriptor};

/// Error type used to represent failures of a [DataStore].
#[derive(Debug, Error)]
pub enum DataStoreError {
    /// The underlying persistent store failed.
    #[error("persistent store failure: {0}")]
    PersistentStore(#[from] PersistentStoreError),

    /// An item could not be converted to or from its stored form.
    #[error("item serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// DataStore is the local repository of feature flags and related data.
///
/// Data sources write to it through [DataStore::init] and [DataStore::upsert]; the evaluator reads
/// from it. Implementations must be safe to call from any number of threads at once.
///
/// Every implementation enforces the same ordering rule: once a key has been observed at some
/// version, no write with an equal or lower version becomes visible.
pub trait DataStore: Send + Sync {
    /// Replaces the entire contents of the store with the given snapshot.
    fn init(&self, all_data: AllData) -> Result<(), DataStoreError>;

    /// Retrieves an item. Deleted items (tombstones) and absent keys both return `None`.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, DataStoreError>;

    /// Retrieves every non-deleted item of a kind.
    fn all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, DataStoreError>;

    /// Updates or inserts an item, or records a tombstone. Returns true only if the write was
    /// applied, which requires the incoming version to be newer than any version already
    /// recorded for the key.
    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, DataStoreError>;

    /// True once the store has received a full snapshot. Never reverts to false.
    fn is_initialized(&self) -> bool;

    /// Whether this store can report outages through a
    /// [crate::stores::DataStoreStatusProvider].
    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }

    /// Releases any resources held by the store.
    fn close(&self) -> Result<(), DataStoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryState {
    data: HashMap<DataKind, HashMap<String, ItemDescriptor>>,
    initialized: bool,
}

/// Default implementation of [DataStore] which holds all data in a thread-safe data structure.
#[derive(Default)]
pub struct InMemoryDataStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, all_data: AllData) -> Result<(), DataStoreError> {
        let data = all_data
            .into_iter()
            .map(|collection| (collection.kind, collection.items.into_iter().collect()))
            .collect();

        let mut state = self.state.write();
        state.data = data;
        state.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, DataStoreError> {
        let state = self.state.read();
        Ok(state
            .data
            .get(&kind)
            .and_then(|items| items.get(key))
            .filter(|item| !item.is_deleted())
            .cloned())
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, DataStoreError> {
        let state = self.state.read();
        Ok(state
            .data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, item)| !item.is_deleted())
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, DataStoreError> {
        let mut state = self.state.write();
        let items = state.data.entry(kind).or_default();
        match items.get(key) {
            Some(existing) if existing.version >= item.version => Ok(false),
            _ => {
                items.insert(key.to_string(), item);
                Ok(true)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Flag;
    use crate::segment::Segment;
    use crate::stores::store_types::{Collection, FEATURES, SEGMENTS};
    use crate::test_common::basic_all_data;
    use proptest::prelude::*;
    use spectral::prelude::*;
    use std::sync::Arc;
    use test_case::test_case;

    fn flag(key: &str, version: u64) -> ItemDescriptor {
        Flag::new_with_version(key, version).into()
    }

    #[test]
    fn is_not_initialized_until_init() {
        let store = InMemoryDataStore::new();
        assert_that!(store.is_initialized()).is_false();

        store.init(vec![]).unwrap();
        assert_that!(store.is_initialized()).is_true();
    }

    #[test]
    fn init_replaces_all_contents() {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();
        store.upsert(FEATURES, "extra", flag("extra", 1)).unwrap();

        store
            .init(vec![Collection {
                kind: FEATURES,
                items: vec![("replacement".into(), flag("replacement", 5))],
            }])
            .unwrap();

        let flags = store.all(FEATURES).unwrap();
        assert_that!(flags).has_length(1);
        assert_that!(flags[0].0.as_str()).is_equal_to("replacement");
        assert_that!(store.all(SEGMENTS).unwrap()).is_empty();
    }

    #[test]
    fn get_returns_items_from_snapshot() {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();

        let item = store.get(FEATURES, "my-flag").unwrap().unwrap();
        assert_that!(item.version).is_equal_to(2);
        let item = store.get(SEGMENTS, "my-segment").unwrap().unwrap();
        assert_that!(item.version).is_equal_to(2);
        assert_that!(store.get(FEATURES, "missing").unwrap()).is_none();
    }

    #[test_case(1, false)]
    #[test_case(2, false)]
    #[test_case(3, true)]
    fn upsert_is_version_gated(version: u64, expected_update: bool) {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();

        let updated = store.upsert(FEATURES, "my-flag", flag("my-flag", version)).unwrap();
        assert_that!(updated).is_equal_to(expected_update);

        let expected_version = if expected_update { version } else { 2 };
        let item = store.get(FEATURES, "my-flag").unwrap().unwrap();
        assert_that!(item.version).is_equal_to(expected_version);
    }

    #[test]
    fn upsert_of_new_key_is_applied_before_init() {
        let store = InMemoryDataStore::new();
        assert_that!(store.upsert(SEGMENTS, "s", Segment::new_with_version("s", 1).into()).unwrap())
            .is_true();
        assert_that!(store.get(SEGMENTS, "s").unwrap()).is_some();
        assert_that!(store.is_initialized()).is_false();
    }

    #[test]
    fn tombstone_hides_item_and_blocks_older_versions() {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();

        let deleted = store
            .upsert(FEATURES, "my-flag", ItemDescriptor::tombstone(4))
            .unwrap();
        assert_that!(deleted).is_true();
        assert_that!(store.get(FEATURES, "my-flag").unwrap()).is_none();
        assert_that!(store
            .all(FEATURES)
            .unwrap()
            .iter()
            .any(|(key, _)| key == "my-flag"))
        .is_false();

        let updated = store.upsert(FEATURES, "my-flag", flag("my-flag", 3)).unwrap();
        assert_that!(updated).is_false();
        assert_that!(store.get(FEATURES, "my-flag").unwrap()).is_none();

        let updated = store.upsert(FEATURES, "my-flag", flag("my-flag", 5)).unwrap();
        assert_that!(updated).is_true();
    }

    #[test]
    fn concurrent_writers_never_lower_versions() {
        let store = Arc::new(InMemoryDataStore::new());
        let handles: Vec<_> = (0..4)
            .map(|offset| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for version in (1..200u64).filter(|v| v % 4 == offset) {
                        store.upsert(FEATURES, "flag", flag("flag", version)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let item = store.get(FEATURES, "flag").unwrap().unwrap();
        assert_that!(item.version).is_equal_to(199);
    }

    proptest! {
        #[test]
        fn observed_versions_never_decrease(versions in prop::collection::vec(0u64..50, 1..40)) {
            let store = InMemoryDataStore::new();
            let mut highest: Option<u64> = None;
            for version in versions {
                let descriptor = if version % 7 == 0 {
                    ItemDescriptor::tombstone(version)
                } else {
                    flag("key", version)
                };
                let updated = store.upsert(FEATURES, "key", descriptor).unwrap();
                prop_assert_eq!(updated, highest.map_or(true, |h| version > h));
                if updated {
                    highest = Some(version);
                }
                if let Some(item) = store.get(FEATURES, "key").unwrap() {
                    prop_assert_eq!(Some(item.version), highest);
                }
            }
        }
    }
}
