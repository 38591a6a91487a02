//! Reorder buffer for entries that arrived before their parents
//!
//! Keyed by the parent's timestamp first so dropping too-old orphans is a
//! cheap range removal. When the missing parent finally inserts, all
//! waiters pop at once and re-enter the validation pipeline; when a parent
//! is refused, its buffered descendants are discarded recursively.

use crate::entry;
use crate::types::{Eid, Iid, older};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Recursion bound for descendant discarding.
const MAX_REJECT_DEPTH: usize = 2048;

#[derive(Default)]
struct Inner {
    // parent timestamp -> parent identity -> waiting entry frames
    data: BTreeMap<u32, BTreeMap<Iid, Vec<Vec<u8>>>>,
    count: usize,
    highwater: usize,
}

#[derive(Default)]
pub struct Detached {
    inner: Mutex<Inner>,
}

impl Detached {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer 'bytes' until the entry identified by 'parent' arrives.
    pub fn insert(&self, parent: &Eid, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .data
            .entry(parent.timestamp)
            .or_default()
            .entry(parent.identity)
            .or_default()
            .push(bytes);
        inner.count += 1;
        inner.highwater = inner.highwater.max(inner.count);
    }

    /// Pop every entry waiting for 'parent'; caller feeds them back into
    /// the validator.
    pub fn accept(&self, parent: &Eid) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(bucket) = inner.data.get_mut(&parent.timestamp) else {
            return Vec::new();
        };
        let Some(waiting) = bucket.remove(&parent.identity) else {
            return Vec::new();
        };
        if bucket.is_empty() {
            inner.data.remove(&parent.timestamp);
        }
        inner.count -= waiting.len();
        waiting
    }

    /// Discard entries waiting for 'parent' and, recursively, everything
    /// waiting for them. Returns the number of entries erased.
    pub fn reject(&self, parent: &Eid) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut pending = vec![*parent];
        let mut erased = 0;
        let mut iterations = 0;

        while let Some(next) = pending.pop() {
            iterations += 1;
            if iterations > MAX_REJECT_DEPTH {
                break;
            }
            let Some(bucket) = inner.data.get_mut(&next.timestamp) else {
                continue;
            };
            let Some(waiting) = bucket.remove(&next.identity) else {
                continue;
            };
            if bucket.is_empty() {
                inner.data.remove(&next.timestamp);
            }
            inner.count -= waiting.len();
            erased += waiting.len();

            for bytes in waiting {
                if bytes.len() >= entry::HEADER_SIZE {
                    pending.push(entry::id(&bytes));
                }
            }
        }
        erased
    }

    /// Deletes all entries whose parent timestamp is older than 'age'.
    pub fn clean(&self, age: u32) {
        let threshold = crate::types::now().wrapping_sub(age);
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        inner.data.retain(|&timestamp, bucket| {
            if older(timestamp, threshold) {
                removed += bucket.values().map(|v| v.len()).sum::<usize>();
                false
            } else {
                true
            }
        });
        inner.count -= removed;
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    /// Peak number of simultaneously buffered entries.
    pub fn highwater(&self) -> usize {
        self.inner.lock().unwrap().highwater
    }

    /// Bytes held by buffered entries, allocation overhead not included.
    pub fn memory(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .data
            .values()
            .flat_map(|bucket| bucket.values())
            .flat_map(|v| v.iter())
            .map(|bytes| bytes.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(timestamp: u32, nonce: u32) -> Eid {
        Eid {
            timestamp,
            identity: Iid {
                timestamp: timestamp.saturating_sub(1),
                nonce,
            },
        }
    }

    /// Minimal frame carrying just id and parent, enough for reject() to
    /// chase descendants.
    fn frame(id: Eid, parent: Eid) -> Vec<u8> {
        let mut bytes = vec![0u8; entry::HEADER_SIZE];
        id.write_to(&mut bytes[0..12]);
        parent.write_to(&mut bytes[12..24]);
        bytes
    }

    #[test]
    fn test_accept_pops_waiters() {
        let detached = Detached::new();
        let parent = eid(100, 1);
        let a = eid(110, 2);
        let b = eid(111, 3);

        detached.insert(&parent, frame(a, parent));
        detached.insert(&parent, frame(b, parent));
        assert_eq!(detached.size(), 2);

        let popped = detached.accept(&parent);
        assert_eq!(popped.len(), 2);
        assert_eq!(detached.size(), 0);
        assert!(detached.accept(&parent).is_empty());
        assert_eq!(detached.highwater(), 2);
    }

    #[test]
    fn test_reject_discards_descendants() {
        let detached = Detached::new();
        let root = eid(100, 1);
        let child = eid(110, 2);
        let grandchild = eid(120, 3);

        // child waits for root, grandchild waits for child
        detached.insert(&root, frame(child, root));
        detached.insert(&child, frame(grandchild, child));
        assert_eq!(detached.size(), 2);

        assert_eq!(detached.reject(&root), 2);
        assert_eq!(detached.size(), 0);
    }

    #[test]
    fn test_clean_by_age() {
        let detached = Detached::new();
        let now = crate::types::now();
        let old_parent = eid(now.saturating_sub(5000), 1);
        let fresh_parent = eid(now, 2);

        detached.insert(&old_parent, frame(eid(now, 3), old_parent));
        detached.insert(&fresh_parent, frame(eid(now, 4), fresh_parent));

        detached.clean(600);
        assert_eq!(detached.size(), 1);
        assert_eq!(detached.accept(&fresh_parent).len(), 1);
    }
}
