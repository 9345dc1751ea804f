use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::store::Membership;

/// A cached lookup result. `None` records that the store has no membership for the context.
pub(crate) type CachedMembership = Option<Arc<Membership>>;

struct LruNode {
    key: String,
    value: CachedMembership,
    expires_at: Instant,
    prev: usize,
    next: usize,
}

const SENTINEL: usize = usize::MAX;

/// Per-context membership cache with LRU eviction and a fixed time-to-live.
///
/// Nodes live in a slab threaded by an intrusive doubly-linked list (head is most recently
/// used), so lookups, promotions and evictions are all O(1). Expired entries are dropped when
/// they are next looked up.
pub(crate) struct MembershipCache {
    index: HashMap<String, usize>,
    slab: Vec<LruNode>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    max_entries: usize,
    ttl: Duration,
}

impl MembershipCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            index: HashMap::new(),
            slab: Vec::new(),
            free: Vec::new(),
            head: SENTINEL,
            tail: SENTINEL,
            max_entries,
            ttl,
        }
    }

    /// Returns the live entry for `key`, promoting it to most recently used. The outer `None`
    /// is a cache miss.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<CachedMembership> {
        let slot = *self.index.get(key)?;
        if self.slab[slot].expires_at <= now {
            self.invalidate(key);
            return None;
        }
        self.detach(slot);
        self.push_front(slot);
        Some(self.slab[slot].value.clone())
    }

    pub fn insert(&mut self, key: String, value: CachedMembership, now: Instant) {
        if self.max_entries == 0 {
            return;
        }
        let expires_at = now + self.ttl;

        if let Some(&slot) = self.index.get(&key) {
            self.slab[slot].value = value;
            self.slab[slot].expires_at = expires_at;
            self.detach(slot);
            self.push_front(slot);
            return;
        }

        if self.index.len() >= self.max_entries {
            self.evict_tail();
        }

        let node = LruNode {
            key: key.clone(),
            value,
            expires_at,
            prev: SENTINEL,
            next: SENTINEL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = node;
                slot
            }
            None => {
                self.slab.push(node);
                self.slab.len() - 1
            }
        };

        self.index.insert(key, slot);
        self.push_front(slot);
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.detach(slot);
                self.release(slot);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slab.clear();
        self.free.clear();
        self.head = SENTINEL;
        self.tail = SENTINEL;
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn detach(&mut self, slot: usize) {
        let prev = self.slab[slot].prev;
        let next = self.slab[slot].next;

        if prev == SENTINEL {
            self.head = next;
        } else {
            self.slab[prev].next = next;
        }
        if next == SENTINEL {
            self.tail = prev;
        } else {
            self.slab[next].prev = prev;
        }

        self.slab[slot].prev = SENTINEL;
        self.slab[slot].next = SENTINEL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slab[slot].prev = SENTINEL;
        self.slab[slot].next = self.head;
        if self.head != SENTINEL {
            self.slab[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == SENTINEL {
            self.tail = slot;
        }
    }

    fn evict_tail(&mut self) {
        if self.tail == SENTINEL {
            return;
        }
        let slot = self.tail;
        self.detach(slot);
        let key = std::mem::take(&mut self.slab[slot].key);
        self.index.remove(&key);
        self.release(slot);
    }

    // Drops the slot's value so a recycled slot does not keep a membership alive.
    fn release(&mut self, slot: usize) {
        self.slab[slot].value = None;
        self.free.push(slot);
    }
}
