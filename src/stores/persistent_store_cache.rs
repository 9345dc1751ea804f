use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

use super::store_types::{AllData, Collection, DataKind, ItemDescriptor};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15);

/// Upper bound on how long a "not initialized" answer is cached, whatever the mode. Another
/// process may initialize the shared store at any time.
pub(crate) const NOT_INITIALIZED_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long the persistent store wrapper keeps items in memory.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum CacheMode {
    /// Every read goes to the persistent store.
    None,
    /// Entries expire after the given time.
    #[serde(rename_all = "camelCase")]
    Ttl {
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        ttl_ms: Duration,
    },
    /// Entries never expire. The persistent store is only read to fill a miss, and the cache is
    /// treated as the freshest copy of the data: it is written back to the store when the store
    /// recovers from an outage.
    Forever,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Ttl {
            ttl_ms: DEFAULT_CACHE_TTL,
        }
    }
}

impl CacheMode {
    pub fn ttl(ttl: Duration) -> Self {
        if ttl.is_zero() {
            CacheMode::None
        } else {
            CacheMode::Ttl { ttl_ms: ttl }
        }
    }
}

struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expiry| now < expiry)
    }
}

#[derive(Default)]
struct CacheState {
    // `None` values record that the store had nothing for the key.
    items: HashMap<(DataKind, String), Entry<Option<ItemDescriptor>>>,
    all: HashMap<DataKind, Entry<Vec<(String, ItemDescriptor)>>>,
    initialized: Option<Entry<bool>>,
}

/// In-memory cache used by [super::PersistentDataStoreWrapper].
///
/// Per-key entries, per-kind "all items" entries and the initialized check are cached
/// independently, each with the configured expiry.
pub(crate) struct PersistentStoreCache {
    mode: CacheMode,
    state: Mutex<CacheState>,
}

impl PersistentStoreCache {
    pub(crate) fn new(mode: CacheMode) -> Self {
        Self {
            mode,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.mode != CacheMode::None
    }

    pub(crate) fn is_infinite(&self) -> bool {
        self.mode == CacheMode::Forever
    }

    fn expiry(&self) -> Option<Instant> {
        match self.mode {
            CacheMode::Ttl { ttl_ms } => Some(Instant::now() + ttl_ms),
            _ => None,
        }
    }

    /// Outer `None` is a cache miss; `Some(None)` means the store is known not to have the key.
    pub(crate) fn get_item(&self, kind: DataKind, key: &str) -> Option<Option<ItemDescriptor>> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        let cache_key = (kind, key.to_string());
        match state.items.get(&cache_key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                state.items.remove(&cache_key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn set_item(&self, kind: DataKind, key: &str, item: Option<ItemDescriptor>) {
        if !self.is_enabled() {
            return;
        }
        let expires_at = self.expiry();
        self.state.lock().items.insert(
            (kind, key.to_string()),
            Entry {
                value: item,
                expires_at,
            },
        );
    }

    /// Caches a value just read from the store, unless the cache already holds a live entry at
    /// the same or a higher version. A concurrent write that landed while the read was in
    /// flight is kept. A known-absent result only fills an empty slot.
    pub(crate) fn set_item_if_newer(
        &self,
        kind: DataKind,
        key: &str,
        item: Option<ItemDescriptor>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let expires_at = self.expiry();
        let mut state = self.state.lock();
        let cache_key = (kind, key.to_string());
        let replace = match state.items.get(&cache_key) {
            Some(existing) if existing.is_live(now) => match (&existing.value, &item) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(existing), Some(read)) => existing.version < read.version,
            },
            _ => true,
        };
        if replace {
            state.items.insert(
                cache_key,
                Entry {
                    value: item,
                    expires_at,
                },
            );
        }
    }

    pub(crate) fn remove_item(&self, kind: DataKind, key: &str) {
        self.state.lock().items.remove(&(kind, key.to_string()));
    }

    pub(crate) fn get_all(&self, kind: DataKind) -> Option<Vec<(String, ItemDescriptor)>> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.all.get(&kind) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                state.all.remove(&kind);
                None
            }
            None => None,
        }
    }

    pub(crate) fn set_all(&self, kind: DataKind, items: Vec<(String, ItemDescriptor)>) {
        if !self.is_enabled() {
            return;
        }
        let expires_at = self.expiry();
        self.state.lock().all.insert(
            kind,
            Entry {
                value: items,
                expires_at,
            },
        );
    }

    pub(crate) fn remove_all(&self, kind: DataKind) {
        self.state.lock().all.remove(&kind);
    }

    /// Replaces one item inside a kind's "all items" entry, if that entry exists.
    pub(crate) fn update_item_in_all(&self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let mut state = self.state.lock();
        if let Some(entry) = state.all.get_mut(&kind) {
            match entry.value.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = item.clone(),
                None => entry.value.push((key.to_string(), item.clone())),
            }
        }
    }

    pub(crate) fn get_initialized(&self) -> Option<bool> {
        if !self.is_enabled() {
            return None;
        }
        let now = Instant::now();
        let state = self.state.lock();
        state
            .initialized
            .as_ref()
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value)
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        if !self.is_enabled() {
            return;
        }
        let expires_at = if initialized {
            self.expiry()
        } else {
            let recheck = match self.mode {
                CacheMode::Ttl { ttl_ms } => ttl_ms.min(NOT_INITIALIZED_RECHECK_INTERVAL),
                _ => NOT_INITIALIZED_RECHECK_INTERVAL,
            };
            Some(Instant::now() + recheck)
        };
        self.state.lock().initialized = Some(Entry {
            value: initialized,
            expires_at,
        });
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.all.clear();
        state.initialized = None;
    }

    /// Everything the cache knows, tombstones included, grouped by kind. Only meaningful for an
    /// infinite cache, where nothing has expired.
    pub(crate) fn snapshot(&self) -> AllData {
        let state = self.state.lock();
        let mut by_kind: HashMap<DataKind, HashMap<String, ItemDescriptor>> = HashMap::new();
        for (kind, entry) in &state.all {
            let items = by_kind.entry(*kind).or_default();
            for (key, item) in &entry.value {
                items.insert(key.clone(), item.clone());
            }
        }
        for ((kind, key), entry) in &state.items {
            if let Some(item) = &entry.value {
                let items = by_kind.entry(*kind).or_default();
                let newer = items
                    .get(key)
                    .map_or(true, |existing| existing.version < item.version);
                if newer {
                    items.insert(key.clone(), item.clone());
                }
            }
        }
        by_kind
            .into_iter()
            .map(|(kind, items)| Collection {
                kind,
                items: items.into_iter().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Flag;
    use crate::stores::store_types::{FEATURES, SEGMENTS};
    use spectral::prelude::*;
    use std::thread::sleep;

    fn flag(key: &str, version: u64) -> ItemDescriptor {
        Flag::new_with_version(key, version).into()
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = PersistentStoreCache::new(CacheMode::None);
        cache.set_item(FEATURES, "f", Some(flag("f", 1)));
        cache.set_initialized(true);

        assert_that!(cache.get_item(FEATURES, "f")).is_none();
        assert_that!(cache.get_initialized()).is_none();
    }

    #[test]
    fn records_known_absence() {
        let cache = PersistentStoreCache::new(CacheMode::Forever);
        cache.set_item(FEATURES, "f", None);
        assert_that!(cache.get_item(FEATURES, "f")).is_equal_to(Some(None));
        assert_that!(cache.get_item(SEGMENTS, "f")).is_none();
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PersistentStoreCache::new(CacheMode::ttl(Duration::from_millis(20)));
        cache.set_item(FEATURES, "f", Some(flag("f", 1)));
        cache.set_all(FEATURES, vec![("f".into(), flag("f", 1))]);
        assert_that!(cache.get_item(FEATURES, "f")).is_some();

        sleep(Duration::from_millis(40));
        assert_that!(cache.get_item(FEATURES, "f")).is_none();
        assert_that!(cache.get_all(FEATURES)).is_none();
    }

    #[test]
    fn read_through_does_not_replace_newer_entry() {
        let cache = PersistentStoreCache::new(CacheMode::Forever);
        cache.set_item(FEATURES, "f", Some(flag("f", 3)));

        cache.set_item_if_newer(FEATURES, "f", Some(flag("f", 2)));
        cache.set_item_if_newer(FEATURES, "f", None);
        assert_that!(cache.get_item(FEATURES, "f").flatten().map(|i| i.version))
            .is_equal_to(Some(3));

        cache.set_item_if_newer(FEATURES, "f", Some(flag("f", 4)));
        assert_that!(cache.get_item(FEATURES, "f").flatten().map(|i| i.version))
            .is_equal_to(Some(4));
    }

    #[test]
    fn read_through_fills_empty_or_absent_slot() {
        let cache = PersistentStoreCache::new(CacheMode::Forever);
        cache.set_item_if_newer(FEATURES, "f", None);
        assert_that!(cache.get_item(FEATURES, "f")).is_equal_to(Some(None));

        cache.set_item_if_newer(FEATURES, "f", Some(flag("f", 1)));
        assert_that!(cache.get_item(FEATURES, "f").flatten().map(|i| i.version))
            .is_equal_to(Some(1));
    }

    #[test]
    fn not_initialized_is_never_cached_forever() {
        let cache = PersistentStoreCache::new(CacheMode::Forever);
        cache.set_initialized(false);
        assert_that!(cache.get_initialized()).is_equal_to(Some(false));
        let expires_at = cache.state.lock().initialized.as_ref().and_then(|e| e.expires_at);
        assert_that!(expires_at).is_some();

        cache.set_initialized(true);
        let expires_at = cache.state.lock().initialized.as_ref().and_then(|e| e.expires_at);
        assert_that!(expires_at).is_none();
    }

    #[test]
    fn not_initialized_expires_within_short_ttl() {
        let cache = PersistentStoreCache::new(CacheMode::ttl(Duration::from_millis(20)));
        cache.set_initialized(false);
        sleep(Duration::from_millis(40));
        assert_that!(cache.get_initialized()).is_none();
    }

    #[test]
    fn zero_ttl_disables_caching() {
        assert_that!(CacheMode::ttl(Duration::ZERO)).is_equal_to(CacheMode::None);
    }

    #[test]
    fn snapshot_prefers_newest_copy() {
        let cache = PersistentStoreCache::new(CacheMode::Forever);
        cache.set_all(FEATURES, vec![("f".into(), flag("f", 1))]);
        cache.set_item(FEATURES, "f", Some(flag("f", 3)));
        cache.set_item(FEATURES, "g", Some(ItemDescriptor::tombstone(2)));

        let snapshot = cache.snapshot();
        assert_that!(snapshot).has_length(1);
        let items: HashMap<_, _> = snapshot[0].items.iter().cloned().collect();
        assert_that!(items["f"].version).is_equal_to(3);
        assert_that!(items["g"].is_deleted()).is_true();
    }

    #[test]
    fn parses_cache_mode() {
        let mode: CacheMode = serde_json::from_str(r#"{"mode": "ttl", "ttlMs": 2500}"#).unwrap();
        assert_that!(mode).is_equal_to(CacheMode::ttl(Duration::from_millis(2500)));
        let mode: CacheMode = serde_json::from_str(r#"{"mode": "forever"}"#).unwrap();
        assert_that!(mode).is_equal_to(CacheMode::Forever);
    }
}
