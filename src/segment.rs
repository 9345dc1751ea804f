use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::is_false;

/// Segment is the data system's view of a user segment.
///
/// As with [crate::Flag], properties the data system does not interpret (rules, salt, ...) are
/// carried through untouched for the evaluator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub unbounded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generation: Option<i64>,

    #[serde(flatten)]
    attributes: Map<String, Value>,
}

impl Segment {
    /// The reference used to look this segment up in a big segment store. Only meaningful for
    /// segments where [Segment::unbounded] is set.
    pub fn unbounded_segment_id(&self) -> String {
        match self.generation {
            None | Some(0) => self.key.clone(),
            Some(generation) => format!("{}.g{}", self.key, generation),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    #[cfg(test)]
    pub(crate) fn new_with_version(key: &str, version: u64) -> Self {
        Segment {
            key: key.to_string(),
            version,
            ..Default::default()
        }
    }
}
