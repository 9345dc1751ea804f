mod cache;
mod store;
mod wrapper;

pub use store::{
    BigSegmentStore, BigSegmentStoreError, Membership, MembershipCheck, StoreMetadata,
};
pub use wrapper::{
    hash_context_key, BigSegmentStoreStatus, BigSegmentStoreWrapper, BigSegmentsStatus,
};
