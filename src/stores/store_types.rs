use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use itertools::Itertools;
use serde_json::{json, Value};

use crate::flag::Flag;
use crate::segment::Segment;

/// DataKind describes a namespace of versioned items, such as feature flags or segments.
///
/// Stores, caches and data sources only ever handle items through a kind's descriptor: they
/// never inspect the concrete item type. The descriptor knows how to name the namespace in a
/// persistent store and in the wire protocol, how to decode an item, and which other items of
/// the same kind it depends on.
#[derive(Clone, Copy)]
pub struct DataKind {
    namespace: &'static str,
    payload_key: &'static str,
    priority: u8,
    decode: fn(Value) -> serde_json::Result<ItemDescriptor>,
    dependencies: fn(&Item) -> Vec<String>,
}

/// Feature flags.
pub const FEATURES: DataKind = DataKind {
    namespace: "features",
    payload_key: "flags",
    priority: 1,
    decode: decode_flag,
    dependencies: flag_dependencies,
};

/// User segments.
pub const SEGMENTS: DataKind = DataKind {
    namespace: "segments",
    payload_key: "segments",
    priority: 0,
    decode: decode_segment,
    dependencies: no_dependencies,
};

/// Every kind the data system knows about.
pub const ALL_KINDS: [DataKind; 2] = [FEATURES, SEGMENTS];

impl DataKind {
    /// The name used to partition items of this kind in a persistent store.
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// The name of this kind inside a full data payload (`{"flags": ..., "segments": ...}`) and
    /// in stream paths (`/flags/<key>`).
    pub fn payload_key(&self) -> &'static str {
        self.payload_key
    }

    /// Path of the single-item polling endpoint for `key`.
    pub fn item_request_path(&self, key: &str) -> String {
        format!("/sdk/latest-{}/{}", self.payload_key, key)
    }

    /// Extracts the item key from a stream path such as `/flags/my-flag`, if the path refers to
    /// this kind.
    pub fn key_from_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix('/')?
            .strip_prefix(self.payload_key)?
            .strip_prefix('/')
            .filter(|key| !key.is_empty())
    }

    pub fn decode_value(&self, value: Value) -> serde_json::Result<ItemDescriptor> {
        (self.decode)(value)
    }

    pub fn deserialize(&self, bytes: &[u8]) -> serde_json::Result<ItemDescriptor> {
        self.decode_value(serde_json::from_slice(bytes)?)
    }

    /// Serializes an item to its self-describing stored form. Tombstones are written as a
    /// placeholder object carrying the key, the version and `"deleted": true`, so the version
    /// and deleted state can always be recovered from the bytes alone.
    pub fn serialize(
        &self,
        key: &str,
        item: &ItemDescriptor,
    ) -> serde_json::Result<SerializedItem> {
        let bytes = match &item.item {
            Some(Item::Flag(flag)) => serde_json::to_vec(flag.as_ref())?,
            Some(Item::Segment(segment)) => serde_json::to_vec(segment.as_ref())?,
            None => serde_json::to_vec(&json!({
                "key": key,
                "version": item.version,
                "deleted": true,
            }))?,
        };
        Ok(SerializedItem {
            version: item.version,
            deleted: item.is_deleted(),
            serialized_item: bytes,
        })
    }

    pub fn make_deleted(&self, _key: &str, version: u64) -> ItemDescriptor {
        ItemDescriptor::tombstone(version)
    }

    /// Keys of same-kind items that must be stored before `item`.
    pub fn dependencies(&self, item: &Item) -> Vec<String> {
        (self.dependencies)(item)
    }
}

impl PartialEq for DataKind {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
    }
}

impl Eq for DataKind {}

impl Hash for DataKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state)
    }
}

impl fmt::Debug for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKind({})", self.namespace)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace)
    }
}

fn decode_flag(value: Value) -> serde_json::Result<ItemDescriptor> {
    serde_json::from_value::<Flag>(value).map(ItemDescriptor::from)
}

fn decode_segment(value: Value) -> serde_json::Result<ItemDescriptor> {
    serde_json::from_value::<Segment>(value).map(ItemDescriptor::from)
}

fn flag_dependencies(item: &Item) -> Vec<String> {
    match item {
        Item::Flag(flag) => flag.prerequisite_keys().map(str::to_string).collect(),
        _ => vec![],
    }
}

fn no_dependencies(_item: &Item) -> Vec<String> {
    vec![]
}

/// An active item of one of the built-in kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
}

impl Item {
    pub fn key(&self) -> &str {
        match self {
            Item::Flag(flag) => &flag.key,
            Item::Segment(segment) => &segment.key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Item::Flag(flag) => flag.version,
            Item::Segment(segment) => segment.version,
        }
    }

    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            Item::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            Item::Segment(segment) => Some(segment),
            _ => None,
        }
    }
}

/// ItemDescriptor is a versioned item or a tombstone.
///
/// A tombstone (`item == None`) records that the key was deleted at `version`. Stores keep
/// tombstones so that an update carrying an older version can never resurrect a deleted item.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDescriptor {
    pub version: u64,
    pub item: Option<Item>,
}

impl ItemDescriptor {
    pub fn new(item: Item) -> Self {
        Self {
            version: item.version(),
            item: Some(item),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            item: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.item.is_none()
    }
}

impl From<Flag> for ItemDescriptor {
    fn from(flag: Flag) -> Self {
        if flag.deleted {
            ItemDescriptor::tombstone(flag.version)
        } else {
            ItemDescriptor::new(Item::Flag(Arc::new(flag)))
        }
    }
}

impl From<Segment> for ItemDescriptor {
    fn from(segment: Segment) -> Self {
        if segment.deleted {
            ItemDescriptor::tombstone(segment.version)
        } else {
            ItemDescriptor::new(Item::Segment(Arc::new(segment)))
        }
    }
}

/// The form in which items are handed to a persistent store.
///
/// `version` and `deleted` are provided for stores that can keep them in separate columns;
/// `serialized_item` is always self-describing, so stores that cannot may ignore them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedItem {
    pub version: u64,
    pub deleted: bool,
    pub serialized_item: Vec<u8>,
}

/// All items of one kind, as delivered by a full snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct Collection<T = ItemDescriptor> {
    pub kind: DataKind,
    pub items: Vec<(String, T)>,
}

/// A full snapshot: one collection per kind.
pub type AllData = Vec<Collection>;

pub type SerializedCollection = Collection<SerializedItem>;

/// Builds a snapshot from decoded flags and segments.
pub fn all_data_from(flags: HashMap<String, Flag>, segments: HashMap<String, Segment>) -> AllData {
    vec![
        Collection {
            kind: FEATURES,
            items: flags
                .into_iter()
                .map(|(key, flag)| (key, flag.into()))
                .collect(),
        },
        Collection {
            kind: SEGMENTS,
            items: segments
                .into_iter()
                .map(|(key, segment)| (key, segment.into()))
                .collect(),
        },
    ]
}

/// Decodes a full data payload of the form `{"flags": {key: flag}, "segments": {key: segment}}`.
/// A kind missing from the payload decodes as an empty collection.
pub(crate) fn decode_all_data(value: Value) -> serde_json::Result<AllData> {
    let mut payload = match value {
        Value::Object(payload) => payload,
        _ => {
            return Err(<serde_json::Error as serde::de::Error>::custom(
                "data payload is not a JSON object",
            ))
        }
    };

    ALL_KINDS
        .iter()
        .map(|kind| {
            let items = match payload.remove(kind.payload_key()) {
                Some(Value::Object(items)) => items
                    .into_iter()
                    .map(|(key, item)| Ok((key, kind.decode_value(item)?)))
                    .collect::<serde_json::Result<Vec<_>>>()?,
                Some(Value::Null) | None => vec![],
                Some(_) => {
                    return Err(<serde_json::Error as serde::de::Error>::custom(format!(
                        "\"{}\" is not a JSON object",
                        kind.payload_key()
                    )))
                }
            };
            Ok(Collection { kind: *kind, items })
        })
        .collect()
}

/// Orders a snapshot so that a store without transactions never exposes an item before the
/// items it depends on: kinds by priority (segments before flags), then items within a kind so
/// that dependencies come first. Unknown dependencies and cycles are tolerated.
pub(crate) fn sort_all_data(all_data: AllData) -> AllData {
    all_data
        .into_iter()
        .sorted_by_key(|collection| collection.kind.priority)
        .map(|collection| Collection {
            kind: collection.kind,
            items: sort_collection_items(collection.kind, collection.items),
        })
        .collect()
}

fn sort_collection_items(
    kind: DataKind,
    items: Vec<(String, ItemDescriptor)>,
) -> Vec<(String, ItemDescriptor)> {
    let mut remaining: HashMap<String, ItemDescriptor> = items.into_iter().collect();
    let keys: Vec<String> = remaining.keys().cloned().sorted().collect();
    let mut visited = HashSet::with_capacity(keys.len());
    let mut sorted = Vec::with_capacity(keys.len());

    for key in keys {
        add_with_dependencies_first(kind, key, &mut remaining, &mut visited, &mut sorted);
    }
    sorted
}

fn add_with_dependencies_first(
    kind: DataKind,
    key: String,
    remaining: &mut HashMap<String, ItemDescriptor>,
    visited: &mut HashSet<String>,
    sorted: &mut Vec<(String, ItemDescriptor)>,
) {
    if !visited.insert(key.clone()) {
        return;
    }
    let descriptor = match remaining.remove(&key) {
        Some(descriptor) => descriptor,
        None => return,
    };
    if let Some(item) = &descriptor.item {
        for dependency in kind.dependencies(item) {
            add_with_dependencies_first(kind, dependency, remaining, visited, sorted);
        }
    }
    sorted.push((key, descriptor));
}
