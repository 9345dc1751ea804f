use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use super::sse::SseEvent;
use crate::http::RequestError;
use crate::stores::{decode_all_data, AllData, DataKind, ItemDescriptor, ALL_KINDS};

/// A stream event, decoded into the store operation it calls for.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamEvent {
    Put(AllData),
    Patch {
        kind: DataKind,
        key: String,
        item: ItemDescriptor,
    },
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
    IndirectPut,
    IndirectPatch {
        kind: DataKind,
        key: String,
    },
}

#[derive(Deserialize)]
struct PutData {
    data: Value,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

fn parse_path(path: &str) -> Option<(DataKind, String)> {
    ALL_KINDS
        .iter()
        .find_map(|kind| kind.key_from_path(path).map(|key| (*kind, key.to_string())))
}

/// Decodes one event. Events of an unknown type, or for a path outside the known kinds, decode
/// as `None` and are skipped.
pub(crate) fn parse_event(event: &SseEvent) -> Result<Option<StreamEvent>, RequestError> {
    let parsed = match event.event.as_str() {
        "put" => {
            let put: PutData = serde_json::from_str(&event.data)?;
            Some(StreamEvent::Put(decode_all_data(put.data)?))
        }
        "patch" => {
            let patch: PatchData = serde_json::from_str(&event.data)?;
            match parse_path(&patch.path) {
                Some((kind, key)) => Some(StreamEvent::Patch {
                    item: kind.decode_value(patch.data)?,
                    kind,
                    key,
                }),
                None => {
                    debug!("Ignoring patch for unknown path {}", patch.path);
                    None
                }
            }
        }
        "delete" => {
            let delete: DeleteData = serde_json::from_str(&event.data)?;
            match parse_path(&delete.path) {
                Some((kind, key)) => Some(StreamEvent::Delete {
                    kind,
                    key,
                    version: delete.version,
                }),
                None => {
                    debug!("Ignoring delete for unknown path {}", delete.path);
                    None
                }
            }
        }
        "indirect/put" => Some(StreamEvent::IndirectPut),
        "indirect/patch" => {
            let path = event.data.trim();
            match parse_path(path) {
                Some((kind, key)) => Some(StreamEvent::IndirectPatch { kind, key }),
                None => {
                    debug!("Ignoring indirect patch for unknown path {}", path);
                    None
                }
            }
        }
        other => {
            info!("Unexpected event found in stream: {}", other);
            None
        }
    };
    Ok(parsed)
}
