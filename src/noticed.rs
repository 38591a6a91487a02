//! Recently-seen entry id cache
//!
//! Suppresses rebroadcast of entries already propagated. Keyed by the eid
//! timestamp so cleaning by age is a single range removal.

use crate::types::{Eid, older};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Default)]
pub struct Noticed {
    data: Mutex<BTreeMap<u32, BTreeSet<crate::types::Iid>>>,
}

impl Noticed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if inserted, false if already present.
    pub fn insert(&self, id: &Eid) -> bool {
        let mut data = self.data.lock().unwrap();
        data.entry(id.timestamp).or_default().insert(id.identity)
    }

    pub fn count(&self, id: &Eid) -> bool {
        let data = self.data.lock().unwrap();
        data.get(&id.timestamp)
            .is_some_and(|set| set.contains(&id.identity))
    }

    /// Deletes all ids older than 'age' seconds.
    pub fn clean(&self, age: u32) {
        let threshold = crate::types::now().wrapping_sub(age);
        let mut data = self.data.lock().unwrap();
        data.retain(|&timestamp, _| !older(timestamp, threshold));
    }

    pub fn size(&self) -> usize {
        let data = self.data.lock().unwrap();
        data.values().map(|set| set.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Iid;

    fn eid(timestamp: u32, nonce: u32) -> Eid {
        Eid {
            timestamp,
            identity: Iid {
                timestamp: timestamp.saturating_sub(5),
                nonce,
            },
        }
    }

    #[test]
    fn test_insert_dedup() {
        let noticed = Noticed::new();
        let id = eid(100, 1);

        assert!(noticed.insert(&id));
        assert!(!noticed.insert(&id));
        assert!(noticed.count(&id));
        assert!(!noticed.count(&eid(100, 2)));
        assert_eq!(noticed.size(), 1);
    }

    #[test]
    fn test_clean_by_age() {
        let noticed = Noticed::new();
        let now = crate::types::now();

        noticed.insert(&eid(now.saturating_sub(1000), 1));
        noticed.insert(&eid(now, 2));
        assert_eq!(noticed.size(), 2);

        noticed.clean(600);
        assert_eq!(noticed.size(), 1);
        assert!(noticed.count(&eid(now, 2)));
    }
}
