use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use super::persistent_store::{PersistentDataStore, PersistentStoreError};
use super::persistent_store_cache::{CacheMode, PersistentStoreCache};
use super::status::{DataStoreStatus, DataStoreStatusProvider};
use super::store::{DataStore, DataStoreError};
use super::store_types::{
    sort_all_data, AllData, Collection, DataKind, ItemDescriptor, SerializedCollection,
    SerializedItem,
};

const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Shared {
    core: Arc<dyn PersistentDataStore>,
    cache: PersistentStoreCache,
    status: Arc<DataStoreStatusProvider>,
    in_outage: AtomicBool,
    closed: AtomicBool,
    poll_interval: Duration,
}

/// PersistentDataStoreWrapper adapts a [PersistentDataStore] to the [DataStore] interface.
///
/// It serializes and deserializes items at the boundary, fronts the persistent store with an
/// optional in-memory cache (see [CacheMode]) and reports outages through a
/// [DataStoreStatusProvider]. When a call to the persistent store fails, the wrapper marks the
/// store unavailable and polls [PersistentDataStore::is_store_available] until it recovers.
pub struct PersistentDataStoreWrapper {
    shared: Arc<Shared>,
    inited: AtomicBool,
}

impl PersistentDataStoreWrapper {
    pub fn new(core: Arc<dyn PersistentDataStore>, cache_mode: CacheMode) -> Self {
        Self::with_poll_interval(core, cache_mode, AVAILABILITY_POLL_INTERVAL)
    }

    pub(crate) fn with_poll_interval(
        core: Arc<dyn PersistentDataStore>,
        cache_mode: CacheMode,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core,
                cache: PersistentStoreCache::new(cache_mode),
                status: Arc::new(DataStoreStatusProvider::new(true)),
                in_outage: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                poll_interval,
            }),
            inited: AtomicBool::new(false),
        }
    }

    pub fn status_provider(&self) -> Arc<DataStoreStatusProvider> {
        self.shared.status.clone()
    }

    fn check<T>(&self, result: Result<T, PersistentStoreError>) -> Result<T, DataStoreError> {
        result.map_err(|e| {
            Shared::report_outage(&self.shared, &e);
            e.into()
        })
    }

    fn get_and_deserialize(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<ItemDescriptor>, DataStoreError> {
        let serialized = self.check(self.shared.core.get(kind, key))?;
        match serialized {
            Some(serialized) => Ok(Some(deserialize_item(kind, &serialized)?)),
            None => Ok(None),
        }
    }
}

impl Shared {
    fn report_outage(shared: &Arc<Shared>, err: &PersistentStoreError) {
        if shared.in_outage.swap(true, Ordering::SeqCst) {
            debug!("Persistent store is still unavailable: {}", err);
            return;
        }
        error!(
            "Persistent store is unavailable, will poll until it recovers: {}",
            err
        );
        shared.status.update_status(DataStoreStatus {
            available: false,
            needs_refresh: false,
        });

        let poller = shared.clone();
        let spawned = thread::Builder::new()
            .name("persistent-store-availability".into())
            .spawn(move || poller.poll_until_available());
        if let Err(e) = spawned {
            error!("Could not start persistent store availability poller: {}", e);
            shared.in_outage.store(false, Ordering::SeqCst);
        }
    }

    fn poll_until_available(&self) {
        loop {
            thread::sleep(self.poll_interval);
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            if !self.core.is_store_available() {
                continue;
            }

            let refreshed = self.cache.is_infinite() && self.refresh_from_cache();
            warn!("Persistent store is available again");
            self.in_outage.store(false, Ordering::SeqCst);
            self.status.update_status(DataStoreStatus {
                available: true,
                needs_refresh: !refreshed,
            });
            return;
        }
    }

    // With an infinite cache the cache holds the freshest data the data source delivered during
    // the outage, so the store can be brought up to date from it directly.
    fn refresh_from_cache(&self) -> bool {
        let all_data = sort_all_data(self.cache.snapshot());
        let result = serialize_all(&all_data)
            .map_err(|e| e.to_string())
            .and_then(|serialized| self.core.init(serialized).map_err(|e| e.to_string()));
        match result {
            Ok(()) => {
                warn!("Successfully updated persistent store from cached data");
                true
            }
            Err(e) => {
                error!(
                    "Failed to write cached data to persistent store after an outage: {}",
                    e
                );
                false
            }
        }
    }
}

fn serialize_all(all_data: &AllData) -> serde_json::Result<Vec<SerializedCollection>> {
    all_data
        .iter()
        .map(|collection| {
            let items = collection
                .items
                .iter()
                .map(|(key, item)| Ok((key.clone(), collection.kind.serialize(key, item)?)))
                .collect::<serde_json::Result<Vec<_>>>()?;
            Ok(Collection {
                kind: collection.kind,
                items,
            })
        })
        .collect()
}

/// Recovers an item from its stored form. When the store kept the version in a separate column
/// as well as in the serialized bytes, the higher of the two wins.
fn deserialize_item(
    kind: DataKind,
    serialized: &SerializedItem,
) -> serde_json::Result<ItemDescriptor> {
    if serialized.serialized_item.is_empty() {
        return Ok(ItemDescriptor::tombstone(serialized.version));
    }
    let mut item = kind.deserialize(&serialized.serialized_item)?;
    item.version = item.version.max(serialized.version);
    if serialized.deleted {
        item.item = None;
    }
    Ok(item)
}

fn without_deleted(items: Vec<(String, ItemDescriptor)>) -> Vec<(String, ItemDescriptor)> {
    items
        .into_iter()
        .filter(|(_, item)| !item.is_deleted())
        .collect()
}

impl DataStore for PersistentDataStoreWrapper {
    fn init(&self, all_data: AllData) -> Result<(), DataStoreError> {
        let all_data = sort_all_data(all_data);
        let serialized = serialize_all(&all_data)?;
        let result = self.check(self.shared.core.init(serialized));

        let cache = &self.shared.cache;
        if result.is_err() && !cache.is_infinite() {
            return result;
        }

        cache.clear();
        for collection in all_data {
            for (key, item) in &collection.items {
                cache.set_item(collection.kind, key, Some(item.clone()));
            }
            cache.set_all(collection.kind, collection.items);
        }

        if result.is_ok() {
            self.inited.store(true, Ordering::SeqCst);
            cache.set_initialized(true);
        }
        result
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, DataStoreError> {
        if let Some(cached) = self.shared.cache.get_item(kind, key) {
            return Ok(cached.filter(|item| !item.is_deleted()));
        }
        let item = self.get_and_deserialize(kind, key)?;
        self.shared.cache.set_item_if_newer(kind, key, item.clone());
        Ok(item.filter(|item| !item.is_deleted()))
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, ItemDescriptor)>, DataStoreError> {
        if let Some(cached) = self.shared.cache.get_all(kind) {
            return Ok(without_deleted(cached));
        }
        let serialized = self.check(self.shared.core.all(kind))?;
        let items = serialized
            .iter()
            .map(|(key, item)| Ok((key.clone(), deserialize_item(kind, item)?)))
            .collect::<serde_json::Result<Vec<_>>>()?;
        self.shared.cache.set_all(kind, items.clone());
        Ok(without_deleted(items))
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, DataStoreError> {
        let serialized = kind.serialize(key, &item)?;
        let result = self.check(self.shared.core.upsert(kind, key, serialized));
        let cache = &self.shared.cache;

        match result {
            Ok(true) => {
                cache.set_item(kind, key, Some(item.clone()));
                if cache.is_infinite() {
                    cache.update_item_in_all(kind, key, &item);
                } else {
                    cache.remove_all(kind);
                }
                Ok(true)
            }
            Ok(false) => {
                // Another writer got there first or our copy was stale; re-read so the cache
                // reflects what the store actually holds.
                if cache.is_enabled() {
                    cache.remove_item(kind, key);
                    cache.remove_all(kind);
                    if let Err(e) = self.get(kind, key) {
                        debug!("Could not refresh {} {} after rejected update: {}", kind, key, e);
                    }
                }
                Ok(false)
            }
            Err(e) => {
                if cache.is_infinite() {
                    let newer = match cache.get_item(kind, key) {
                        Some(Some(existing)) => existing.version < item.version,
                        _ => true,
                    };
                    if newer {
                        cache.set_item(kind, key, Some(item.clone()));
                        cache.update_item_in_all(kind, key, &item);
                    }
                }
                Err(e)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        if self.inited.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(cached) = self.shared.cache.get_initialized() {
            if cached {
                self.inited.store(true, Ordering::SeqCst);
            }
            return cached;
        }
        let initialized = self.shared.core.is_initialized();
        if initialized {
            self.inited.store(true, Ordering::SeqCst);
        }
        self.shared.cache.set_initialized(initialized);
        initialized
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        true
    }

    fn close(&self) -> Result<(), DataStoreError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.core.close()?;
        Ok(())
    }
}
