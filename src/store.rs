use std::sync::Arc;

use log::warn;

use crate::flag::Flag;
use crate::segment::Segment;
use crate::stores::{DataStore, FEATURES, SEGMENTS};

/// Store is the read-only view of flag data used by the evaluation engine.
///
/// It is implemented for every [DataStore], so the evaluator can be handed whichever store the
/// data system was configured with. A store failure is logged and reads as "not found"; the
/// evaluator is expected to fall back to its default value in that case.
pub trait Store {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>>;
}

impl<T: DataStore + ?Sized> Store for T {
    fn flag(&self, flag_key: &str) -> Option<Arc<Flag>> {
        match self.get(FEATURES, flag_key) {
            Ok(item) => item.and_then(|d| d.item.and_then(|item| item.as_flag().cloned())),
            Err(e) => {
                warn!("Error retrieving flag {}: {}", flag_key, e);
                None
            }
        }
    }

    fn segment(&self, segment_key: &str) -> Option<Arc<Segment>> {
        match self.get(SEGMENTS, segment_key) {
            Ok(item) => item.and_then(|d| d.item.and_then(|item| item.as_segment().cloned())),
            Err(e) => {
                warn!("Error retrieving segment {}: {}", segment_key, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::stores::{DataStore, InMemoryDataStore, ItemDescriptor, FEATURES};
    use crate::test_common::basic_all_data;
    use spectral::prelude::*;

    #[test]
    fn reads_typed_items_from_any_data_store() {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();

        let flag = store.flag("my-flag").unwrap();
        assert_that!(flag.version).is_equal_to(2);
        let segment = store.segment("my-segment").unwrap();
        assert_that!(segment.version).is_equal_to(2);

        assert_that!(store.flag("my-segment")).is_none();
        assert_that!(store.segment("my-flag")).is_none();
    }

    #[test]
    fn deleted_flags_are_not_found() {
        let store = InMemoryDataStore::new();
        store.init(basic_all_data()).unwrap();
        store
            .upsert(FEATURES, "my-flag", ItemDescriptor::tombstone(3))
            .unwrap();

        let dyn_store: &dyn DataStore = &store;
        assert_that!(dyn_store.flag("my-flag")).is_none();
    }
}
