//! Channel/thread subscriptions
//!
//! A connection tracks what the peer wants to receive; the node tracks the
//! same per client application, persisted one file per app uuid under the
//! database path so subscriptions survive restarts.

use crate::types::Eid;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Sorted list of subscribed eids plus the everything flag. With the flag
/// set, the peer receives all data regardless of the list.
#[derive(Default)]
pub struct Subscriptions {
    data: RwLock<SubscriptionsData>,
}

#[derive(Default)]
struct SubscriptionsData {
    list: Vec<Eid>,
    everything: bool,
    changed: bool,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert honoring 'limit' to keep a malicious peer from exhausting
    /// memory; exceeding the limit flips to everything instead.
    pub fn subscribe(&self, id: &Eid, limit: usize) {
        let mut data = self.data.write().unwrap();
        if let Err(position) = data.list.binary_search(id) {
            if data.list.len() >= limit {
                data.everything = true;
            } else {
                data.list.insert(position, *id);
            }
            data.changed = true;
        }
    }

    pub fn subscribe_to_everything(&self) {
        let mut data = self.data.write().unwrap();
        data.everything = true;
        data.changed = true;
    }

    pub fn unsubscribe(&self, id: &Eid) {
        let mut data = self.data.write().unwrap();
        if let Ok(position) = data.list.binary_search(id) {
            data.list.remove(position);
            data.changed = true;
        }
    }

    /// True if subscribed to any of the listed eids, or to everything.
    pub fn is_subscribed(&self, ids: &[Eid]) -> bool {
        let data = self.data.read().unwrap();
        data.everything || ids.iter().any(|id| data.list.binary_search(id).is_ok())
    }

    pub fn everything(&self) -> bool {
        self.data.read().unwrap().everything
    }

    pub fn enumerate(&self) -> Vec<Eid> {
        self.data.read().unwrap().list.clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().list.is_empty()
    }

    fn take_changed(&self) -> bool {
        let mut data = self.data.write().unwrap();
        std::mem::replace(&mut data.changed, false)
    }

    /// File format: concatenated 12-byte eids.
    pub fn save(&self, path: &Path) -> io::Result<usize> {
        let data = self.data.read().unwrap();
        let mut bytes = Vec::with_capacity(data.list.len() * Eid::SIZE);
        for id in &data.list {
            bytes.extend_from_slice(&id.to_bytes());
        }
        std::fs::write(path, bytes)?;
        Ok(data.list.len())
    }

    pub fn load(&self, path: &Path) -> io::Result<usize> {
        let bytes = std::fs::read(path)?;
        let mut list: Vec<Eid> = bytes
            .chunks_exact(Eid::SIZE)
            .map(Eid::read_from)
            .collect();
        list.sort();
        list.dedup();

        let mut data = self.data.write().unwrap();
        let n = list.len();
        data.list = list;
        data.changed = false;
        Ok(n)
    }
}

// =============================================================================
// SUBSCRIPTION SET
// =============================================================================

/// Per-application subscription lists, one file per app uuid. Also used
/// for the blacklist and the retained set, which share the format.
pub struct SubscriptionSet {
    path: PathBuf,
    data: RwLock<BTreeMap<Uuid, Subscriptions>>,
}

impl SubscriptionSet {
    pub fn new(base: &Path, name: &str) -> Self {
        Self {
            path: base.join(name),
            data: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn subscribe(&self, app: &Uuid, id: &Eid) {
        let mut data = self.data.write().unwrap();
        data.entry(*app)
            .or_insert_with(Subscriptions::new)
            .subscribe(id, usize::MAX);
    }

    pub fn unsubscribe(&self, app: &Uuid, id: &Eid) -> bool {
        let data = self.data.read().unwrap();
        match data.get(app) {
            Some(subscriptions) => {
                let was = subscriptions.is_subscribed(std::slice::from_ref(id));
                subscriptions.unsubscribe(id);
                was
            }
            None => false,
        }
    }

    /// True if any application subscribes to any of the eids.
    pub fn is_subscribed(&self, ids: &[Eid]) -> bool {
        let data = self.data.read().unwrap();
        data.values().any(|s| s.is_subscribed(ids))
    }

    pub fn enumerate(&self) -> Vec<Eid> {
        let data = self.data.read().unwrap();
        let mut all: Vec<Eid> = data.values().flat_map(|s| s.enumerate()).collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn load(&self) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut data = self.data.write().unwrap();
        for file in entries.flatten() {
            let name = file.file_name();
            let Some(app) = name.to_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            let subscriptions = Subscriptions::new();
            match subscriptions.load(&file.path()) {
                Ok(n) => {
                    debug!(app = %app, count = n, "loaded subscription set");
                    data.insert(app, subscriptions);
                }
                Err(e) => warn!(app = %app, error = %e, "subscription set unreadable"),
            }
        }
        Ok(())
    }

    /// Saves every list that changed since the last flush.
    pub fn flush(&self) {
        let data = self.data.read().unwrap();
        for (app, subscriptions) in data.iter() {
            if subscriptions.take_changed() {
                if let Err(e) = std::fs::create_dir_all(&self.path)
                    .and_then(|_| subscriptions.save(&self.path.join(app.to_string())))
                {
                    warn!(app = %app, error = %e, "subscription set flush failed");
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Iid;

    fn eid(n: u32) -> Eid {
        Eid {
            timestamp: n,
            identity: Iid {
                timestamp: n / 2,
                nonce: n,
            },
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let subs = Subscriptions::new();
        subs.subscribe(&eid(5), 100);
        subs.subscribe(&eid(3), 100);
        subs.subscribe(&eid(5), 100);

        assert_eq!(subs.len(), 2);
        assert!(subs.is_subscribed(&[eid(3)]));
        assert!(!subs.is_subscribed(&[eid(4)]));

        subs.unsubscribe(&eid(3));
        assert!(!subs.is_subscribed(&[eid(3)]));
    }

    #[test]
    fn test_limit_escalates_to_everything() {
        let subs = Subscriptions::new();
        subs.subscribe(&eid(1), 2);
        subs.subscribe(&eid(2), 2);
        assert!(!subs.everything());

        subs.subscribe(&eid(3), 2);
        assert!(subs.everything());
        // everything matches anything now
        assert!(subs.is_subscribed(&[eid(99)]));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("raddi-subs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("list");

        let subs = Subscriptions::new();
        subs.subscribe(&eid(10), 100);
        subs.subscribe(&eid(20), 100);
        subs.save(&path).unwrap();

        let loaded = Subscriptions::new();
        assert_eq!(loaded.load(&path).unwrap(), 2);
        assert!(loaded.is_subscribed(&[eid(10)]));
        assert!(loaded.is_subscribed(&[eid(20)]));
        assert!(!loaded.is_subscribed(&[eid(30)]));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_set_persists_per_app() {
        let dir = std::env::temp_dir().join(format!("raddi-subset-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let app = Uuid::new_v4();
        let set = SubscriptionSet::new(&dir, "subscriptions");
        set.subscribe(&app, &eid(7));
        assert!(set.is_subscribed(&[eid(7)]));
        set.flush();

        let reloaded = SubscriptionSet::new(&dir, "subscriptions");
        reloaded.load().unwrap();
        assert!(reloaded.is_subscribed(&[eid(7)]));

        assert!(reloaded.unsubscribe(&app, &eid(7)));
        assert!(!reloaded.is_subscribed(&[eid(7)]));

        std::fs::remove_dir_all(&dir).ok();
    }
}
