use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::is_false;

/// Flag is the data system's view of a feature flag.
///
/// Only the fields the data system itself needs are modelled: the key, the version used for
/// update ordering, the tombstone marker and the prerequisite list (which decides the order
/// flags are written to a persistent store). Every other property of the flag is kept verbatim
/// in [Flag::attribute] so that the evaluator receives exactly what the service sent.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(default)]
    pub prerequisites: Vec<Prereq>,

    #[serde(flatten)]
    attributes: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Prereq {
    pub key: String,
    pub variation: usize,
}

impl Flag {
    /// Keys of the flags this flag depends on, in declaration order.
    pub fn prerequisite_keys(&self) -> impl Iterator<Item = &str> {
        self.prerequisites.iter().map(|p| p.key.as_str())
    }

    /// Returns a property of the flag that the data system does not interpret, such as `on`
    /// or `rules`.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    #[cfg(test)]
    pub(crate) fn new_with_version(key: &str, version: u64) -> Self {
        Self {
            key: key.to_string(),
            version,
            deleted: false,
            prerequisites: vec![],
            attributes: Map::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_prerequisites(mut self, keys: &[&str]) -> Self {
        self.prerequisites = keys
            .iter()
            .map(|key| Prereq {
                key: key.to_string(),
                variation: 0,
            })
            .collect();
        self
    }
}
