//! Database table: a sorted vector of shards
//!
//! A shard covers [base, next shard's base); lookups binary-search by the
//! id timestamp. The latest shard grows until it reaches the maximum row
//! count, then splits at the incoming timestamp.

use super::DbSettings;
use super::row::{DbRow, Root};
use super::shard::Shard;
use crate::entry;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Table resource usage, aggregated into database statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub rows: usize,
    pub shards_total: usize,
    pub shards_active: usize,
}

impl std::ops::AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        self.rows += other.rows;
        self.shards_total += other.shards_total;
        self.shards_active += other.shards_active;
    }
}

pub struct Table<K: DbRow> {
    pub name: &'static str,
    path: PathBuf,
    shards: RwLock<Vec<Shard<K>>>,
    settings: Arc<DbSettings>,
}

impl<K: DbRow> Table<K> {
    pub fn new(base: &Path, name: &'static str, settings: Arc<DbSettings>) -> Self {
        Self {
            name,
            path: base.join(name),
            shards: RwLock::new(Vec::new()),
            settings,
        }
    }

    /// Rebuild the shard index from directory contents. Shards stay closed
    /// until first access.
    pub fn reload(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.path)?;

        let mut shards = Vec::new();
        for file in std::fs::read_dir(&self.path)?.flatten() {
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(base) = name
                .strip_suffix(".idx")
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                shards.push(Shard::new(base));
            }
        }
        shards.sort_by_key(|shard: &Shard<K>| shard.base);
        debug!(table = self.name, shards = shards.len(), "table reloaded");

        *self.shards.write().unwrap() = shards;
        Ok(())
    }

    pub fn empty(&self) -> bool {
        self.shards.read().unwrap().is_empty()
    }

    /// Insert a whole decoded entry frame, creating or splitting shards as
    /// needed. If the id already exists, 'exists' is set and nothing
    /// changes.
    pub fn insert(&self, bytes: &[u8], top: &Root, exists: &mut bool) -> io::Result<bool> {
        let timestamp = entry::id(bytes).timestamp;
        let mut shards = self.shards.write().unwrap();

        if shards.is_empty() {
            shards.push(Shard::new(timestamp));
        }

        // last shard with base <= timestamp; older than everything starts
        // a new shard based at the entry itself
        let covering = shards.partition_point(|shard| shard.base <= timestamp);
        let mut position = if covering == 0 {
            shards.insert(0, Shard::new(timestamp));
            0
        } else {
            covering - 1
        };

        if shards[position].size(&self.path)? >= self.settings.maximum_shard_size {
            let newer = shards[position].split(&self.path, timestamp)?;
            position += 1;
            shards.insert(position, newer);
        }
        shards[position].insert(&self.path, bytes, top, exists)
    }

    fn covering(shards: &[Shard<K>], timestamp: u32) -> Option<usize> {
        match shards.partition_point(|shard| shard.base <= timestamp) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn get(&self, id: K::Id) -> Option<K> {
        let shards = self.shards.read().unwrap();
        let position = Self::covering(&shards, K::id_timestamp(&id))?;
        shards[position]
            .get(&self.path, id)
            .unwrap_or_else(|e| {
                warn!(table = self.name, error = %e, "shard read failed");
                None
            })
    }

    /// Reconstruct the full entry frame for transmission.
    pub fn get_entry(&self, id: K::Id) -> Option<Vec<u8>> {
        let shards = self.shards.read().unwrap();
        let position = Self::covering(&shards, K::id_timestamp(&id))?;
        shards[position]
            .get_entry(&self.path, id)
            .unwrap_or_else(|e| {
                warn!(table = self.name, error = %e, "shard read failed");
                None
            })
    }

    pub fn erase(&self, id: K::Id, thorough: bool) -> io::Result<bool> {
        let shards = self.shards.read().unwrap();
        let Some(position) = Self::covering(&shards, K::id_timestamp(&id)) else {
            return Ok(false);
        };
        shards[position].erase(&self.path, id, thorough)
    }

    /// Enumerate rows within [oldest, latest] inclusive. 'constrain'
    /// filters, 'query' decides whether the full entry bytes are read and
    /// passed to 'callback'; callback returning false stops enumeration.
    /// Returns the number of constrained matches.
    pub fn select(
        &self,
        oldest: u32,
        latest: u32,
        mut constrain: impl FnMut(&K) -> bool,
        mut query: impl FnMut(&K) -> bool,
        mut callback: impl FnMut(&K, &[u8]) -> bool,
    ) -> usize {
        let shards = self.shards.read().unwrap();
        let start = Self::covering(&shards, oldest).unwrap_or(0);

        let mut matched = 0;
        for shard in shards[start..].iter() {
            if shard.base > latest {
                break;
            }
            match shard.select(
                &self.path,
                oldest,
                latest,
                &mut constrain,
                &mut query,
                &mut callback,
            ) {
                Ok((n, keep_going)) => {
                    matched += n;
                    if !keep_going {
                        break;
                    }
                }
                Err(e) => {
                    warn!(table = self.name, base = shard.base, error = %e, "shard select failed");
                }
            }
        }
        matched
    }

    /// Number of rows within the inclusive timestamp range.
    pub fn count(&self, oldest: u32, latest: u32) -> usize {
        self.select(oldest, latest, |_| true, |_| false, |_, _| true)
    }

    /// Base timestamp and approximate row count of every shard, oldest
    /// first; the callback returns false to stop.
    pub fn enumerate_shard_info(&self, mut callback: impl FnMut(u32, usize) -> bool) {
        let shards = self.shards.read().unwrap();
        for shard in shards.iter() {
            if !callback(shard.base, shard.size_hint(&self.path)) {
                break;
            }
        }
    }

    /// Key of the latest (youngest) live row.
    pub fn top(&self) -> Option<K> {
        let shards = self.shards.read().unwrap();
        for shard in shards.iter().rev() {
            match shard.top(&self.path) {
                Ok(Some(row)) => return Some(row),
                Ok(None) => continue,
                Err(e) => {
                    warn!(table = self.name, error = %e, "shard top failed");
                    return None;
                }
            }
        }
        None
    }

    /// Close shards not accessed since 'threshold'; returns closed count.
    pub fn optimize(&self, threshold: u32) -> usize {
        let shards = self.shards.read().unwrap();
        let mut closed = 0;
        for shard in shards.iter() {
            if !shard.closed() && crate::types::older(shard.accessed(), threshold) && shard.close()
            {
                closed += 1;
            }
        }
        closed
    }

    /// Close least-recently-accessed shards down to 'keep' open; returns
    /// closed count.
    pub fn prune(&self, keep: usize) -> usize {
        let shards = self.shards.read().unwrap();
        let mut open: Vec<&Shard<K>> = shards.iter().filter(|s| !s.closed()).collect();
        if open.len() <= keep {
            return 0;
        }
        open.sort_by_key(|shard| shard.accessed());

        let mut closed = 0;
        for shard in open.iter().take(open.len() - keep) {
            if shard.close() {
                closed += 1;
            }
        }
        closed
    }

    pub fn stats(&self) -> Statistics {
        let shards = self.shards.read().unwrap();
        let mut stats = Statistics {
            rows: 0,
            shards_total: shards.len(),
            shards_active: 0,
        };
        for shard in shards.iter() {
            stats.rows += shard.size_hint(&self.path);
            if !shard.closed() {
                stats.shards_active += 1;
            }
        }
        stats
    }

    pub fn flush(&self) {
        let shards = self.shards.read().unwrap();
        for shard in shards.iter() {
            shard.flush();
        }
    }

    /// Stamp for freshness comparisons in history digests.
    pub fn newest_timestamp(&self) -> Option<u32> {
        self.top().map(|row| row.timestamp())
    }
}
