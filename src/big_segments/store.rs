use std::collections::HashSet;
use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type returned by [BigSegmentStore] implementations.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BigSegmentStoreError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl BigSegmentStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Store-wide information maintained by whatever process populates the big segment store.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetadata {
    /// When the store was last known to be synchronized with the service, in Unix
    /// milliseconds. `None` if it never has been.
    pub last_up_to_date: Option<i64>,
}

/// The answer to "is this context in that segment?".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipCheck {
    Included,
    Excluded,
    /// The store says nothing about the segment; the segment's own rules decide.
    Unknown,
}

/// The big segments a single context is explicitly included in or excluded from, keyed by
/// segment reference (see [crate::Segment::unbounded_segment_id]).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Membership {
    included: HashSet<String>,
    excluded: HashSet<String>,
}

impl Membership {
    pub fn new<I, E>(included: I, excluded: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            included: included.into_iter().map(Into::into).collect(),
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    /// Inclusion takes precedence over exclusion for a reference listed in both sets.
    pub fn check(&self, segment_ref: &str) -> MembershipCheck {
        if self.included.contains(segment_ref) {
            MembershipCheck::Included
        } else if self.excluded.contains(segment_ref) {
            MembershipCheck::Excluded
        } else {
            MembershipCheck::Unknown
        }
    }

    /// Combines the references of `other` into this membership.
    pub fn merge(&mut self, other: &Membership) {
        self.included.extend(other.included.iter().cloned());
        self.excluded.extend(other.excluded.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty() && self.excluded.is_empty()
    }
}

/// BigSegmentStore is the contract for a big segment database integration.
///
/// Calls are made from evaluator threads on a cache miss and from the status poller, so
/// implementations must tolerate concurrent use.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<StoreMetadata, BigSegmentStoreError>;

    /// Looks up the membership of the context whose key hashes to `context_hash`. `None` means
    /// the store has no record for that context.
    fn get_membership(
        &self,
        context_hash: &str,
    ) -> Result<Option<Membership>, BigSegmentStoreError>;

    fn close(&self) -> Result<(), BigSegmentStoreError> {
        Ok(())
    }
}
