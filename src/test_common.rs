#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use maplit::hashmap;
use parking_lot::Mutex;

use crate::big_segments::{
    hash_context_key, BigSegmentStore, BigSegmentStoreError, Membership, StoreMetadata,
};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::stores::{
    all_data_from, AllData, DataKind, PersistentDataStore, PersistentStoreError,
    SerializedCollection, SerializedItem,
};
use crate::util::unix_millis_now;

pub const BASIC_PAYLOAD: &str = r#"{
    "flags": {"my-flag": {"key": "my-flag", "version": 2}},
    "segments": {"my-segment": {"key": "my-segment", "version": 2}}
}"#;

pub const BASIC_PUT: &str = r#"{"path": "/", "data": {
    "flags": {"my-flag": {"key": "my-flag", "version": 2}},
    "segments": {"my-segment": {"key": "my-segment", "version": 2}}
}}"#;

pub const MY_FLAG_V3: &str = r#"{"key": "my-flag", "version": 3}"#;

/// The snapshot described by [BASIC_PAYLOAD].
pub fn basic_all_data() -> AllData {
    all_data_from(
        hashmap! {"my-flag".to_string() => Flag::new_with_version("my-flag", 2)},
        hashmap! {"my-segment".to_string() => Segment::new_with_version("my-segment", 2)},
    )
}

/// Formats one server-sent event as it appears on the wire. Multi-line data is not supported.
pub fn sse_event(name: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", name, data.replace('\n', ""))
}

/// How a [MockPersistentStore] keeps versions.
#[derive(Clone, Copy, Debug)]
pub enum BackendStyle {
    /// Version and deleted state live in their own columns and upserts are conditional writes.
    VersionColumn,
    /// Only the serialized bytes are stored; upserts read, write, then re-read.
    BytesOnly,
}

#[derive(Default)]
struct MockPersistentData {
    items: HashMap<&'static str, HashMap<String, SerializedItem>>,
    initialized: bool,
}

pub struct MockPersistentStore {
    style: BackendStyle,
    data: Mutex<MockPersistentData>,
    available: AtomicBool,
    get_count: AtomicUsize,
    is_initialized_count: AtomicUsize,
    read_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl MockPersistentStore {
    pub fn new(style: BackendStyle) -> Self {
        Self {
            style,
            data: Mutex::new(MockPersistentData::default()),
            available: AtomicBool::new(true),
            get_count: AtomicUsize::new(0),
            is_initialized_count: AtomicUsize::new(0),
            read_gate: Mutex::new(None),
        }
    }

    /// Makes the next `get` pause after it has read the item but before it returns. The first
    /// receiver fires once the read has happened; sending on the returned sender lets it finish.
    pub fn pause_next_get(&self) -> (Receiver<()>, Sender<()>) {
        let (read_done_tx, read_done_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.read_gate.lock() = Some((read_done_tx, release_rx));
        (read_done_rx, release_tx)
    }

    /// Writes an item directly, as another SDK instance sharing the database would.
    pub fn put_raw(&self, kind: DataKind, key: &str, item: SerializedItem) {
        let item = self.to_stored(item);
        self.data
            .lock()
            .items
            .entry(kind.namespace())
            .or_default()
            .insert(key.to_string(), item);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get_count(&self) -> usize {
        self.get_count.load(Ordering::SeqCst)
    }

    pub fn is_initialized_count(&self) -> usize {
        self.is_initialized_count.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), PersistentStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistentStoreError::new("store unavailable"))
        }
    }

    fn to_stored(&self, item: SerializedItem) -> SerializedItem {
        match self.style {
            BackendStyle::VersionColumn => item,
            BackendStyle::BytesOnly => SerializedItem {
                version: 0,
                deleted: false,
                serialized_item: item.serialized_item,
            },
        }
    }

    fn stored_version(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<u64>, PersistentStoreError> {
        let data = self.data.lock();
        let stored = match data.items.get(kind.namespace()).and_then(|items| items.get(key)) {
            Some(stored) => stored,
            None => return Ok(None),
        };
        match self.style {
            BackendStyle::VersionColumn => Ok(Some(stored.version)),
            BackendStyle::BytesOnly => kind
                .deserialize(&stored.serialized_item)
                .map(|item| Some(item.version))
                .map_err(|e| PersistentStoreError::with_source("corrupt item", e)),
        }
    }
}

impl PersistentDataStore for MockPersistentStore {
    fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), PersistentStoreError> {
        self.check_available()?;
        let mut items: HashMap<&'static str, HashMap<String, SerializedItem>> = HashMap::new();
        for collection in all_data {
            let stored = items.entry(collection.kind.namespace()).or_default();
            for (key, item) in collection.items {
                stored.insert(key, self.to_stored(item));
            }
        }
        let mut data = self.data.lock();
        data.items = items;
        data.initialized = true;
        Ok(())
    }

    fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> Result<Option<SerializedItem>, PersistentStoreError> {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let item = self
            .data
            .lock()
            .items
            .get(kind.namespace())
            .and_then(|items| items.get(key))
            .cloned();
        let gate = self.read_gate.lock().take();
        if let Some((read_done, release)) = gate {
            let _ = read_done.send(());
            let _ = release.recv();
        }
        Ok(item)
    }

    fn all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, PersistentStoreError> {
        self.check_available()?;
        Ok(self
            .data
            .lock()
            .items
            .get(kind.namespace())
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, PersistentStoreError> {
        self.check_available()?;
        match self.style {
            BackendStyle::VersionColumn => {
                let mut data = self.data.lock();
                let items = data.items.entry(kind.namespace()).or_default();
                if let Some(existing) = items.get(key) {
                    if existing.version >= item.version {
                        return Ok(false);
                    }
                }
                items.insert(key.to_string(), item);
                Ok(true)
            }
            BackendStyle::BytesOnly => {
                let version = item.version;
                for _ in 0..3 {
                    if let Some(current) = self.stored_version(kind, key)? {
                        if current >= version {
                            return Ok(false);
                        }
                    }
                    self.put_raw(kind, key, item.clone());
                    if self.stored_version(kind, key)? == Some(version) {
                        return Ok(true);
                    }
                }
                Err(PersistentStoreError::new("too many concurrent writers"))
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.is_initialized_count.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst) && self.data.lock().initialized
    }

    fn is_store_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

pub struct MockBigSegmentStore {
    memberships: Mutex<HashMap<String, Membership>>,
    last_up_to_date: Mutex<Option<i64>>,
    available: AtomicBool,
    membership_queries: Mutex<Vec<String>>,
    metadata_queries: AtomicUsize,
}

impl MockBigSegmentStore {
    /// A store that reports having been updated just now.
    pub fn new() -> Self {
        Self {
            memberships: Mutex::new(HashMap::new()),
            last_up_to_date: Mutex::new(Some(unix_millis_now())),
            available: AtomicBool::new(true),
            membership_queries: Mutex::new(Vec::new()),
            metadata_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_membership(&self, context_key: &str, membership: Membership) {
        self.memberships
            .lock()
            .insert(hash_context_key(context_key), membership);
    }

    pub fn set_last_up_to_date(&self, last_up_to_date: Option<i64>) {
        *self.last_up_to_date.lock() = last_up_to_date;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The context hashes looked up so far, in order.
    pub fn membership_queries(&self) -> Vec<String> {
        self.membership_queries.lock().clone()
    }

    pub fn metadata_queries(&self) -> usize {
        self.metadata_queries.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), BigSegmentStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BigSegmentStoreError::new("store unavailable"))
        }
    }
}

impl BigSegmentStore for MockBigSegmentStore {
    fn get_metadata(&self) -> Result<StoreMetadata, BigSegmentStoreError> {
        self.metadata_queries.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(StoreMetadata {
            last_up_to_date: *self.last_up_to_date.lock(),
        })
    }

    fn get_membership(
        &self,
        context_hash: &str,
    ) -> Result<Option<Membership>, BigSegmentStoreError> {
        self.membership_queries.lock().push(context_hash.to_string());
        self.check_available()?;
        Ok(self.memberships.lock().get(context_hash).cloned())
    }
}
