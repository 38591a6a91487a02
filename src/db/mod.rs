//! Sharded entry database
//!
//! Four append-only tables (data, threads, channels, identities), each a
//! sorted vector of per-timestamp shards, plus the five persistent peer
//! sets. One writer per directory, guarded by an OS lock on `.lock`; any
//! number of read-only openers.

pub mod peerset;
pub mod row;
pub mod shard;
pub mod table;

pub use peerset::{LEVELS, Level, NEW_RECORD_ASSESSMENT, PeerSet};
pub use row::{CRow, DbRow, IRow, Root, Row, TRow};
pub use table::{Statistics, Table};

use crate::crypto;
use crate::entry::{self, Announcement};
use crate::types::{Eid, now};
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// SETTINGS
// =============================================================================

#[derive(Debug, Clone)]
pub struct DbSettings {
    /// Protocol magic; part of the identity nonce derivation.
    pub magic: [u8; 8],

    /// Insert all valid received entries regardless of subscriptions.
    /// This is the mode for core network nodes.
    pub store_everything: bool,

    /// Rows in the latest shard before creating a new one is considered.
    pub minimum_shard_size: usize,

    /// Hard row limit; an insert into a full shard splits it. Shards are
    /// searched linearly and re-sorted on insertion, tune carefully.
    pub maximum_shard_size: usize,

    /// Seconds a shard stays open after last access; 0 disables trimming.
    pub shard_trimming_threshold: u32,

    /// Strong optimization keeps at least this many shards open.
    pub minimum_active_shards: usize,

    /// Soft limit of open shards; each uses two OS handles.
    pub maximum_active_shards: usize,

    /// Granularity of backward data requests, seconds.
    pub backtrack_granularity: u32,
    /// Granularity of forward retention windows, seconds.
    pub forward_granularity: u32,

    /// Age of entries to request from a channel when subscribing fresh.
    pub synchronization_threshold: u32,
    /// Overlap when resuming synchronization, accounts for data lost in
    /// transit.
    pub synchronization_base_offset: u32,
    /// Overlap used by nodes that synchronize everything.
    pub synchronization_everything_base_offset: u32,

    /// Interval of periodic flushes, milliseconds.
    pub disk_flush_interval: u64,

    /// Skip proof-of-work graph verification in assess; signatures are
    /// still checked. Test and benchmark facility, never enable on a
    /// networked node.
    pub skip_proof_verification: bool,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            magic: *crate::net::protocol::MAGIC,
            store_everything: false,
            minimum_shard_size: 2048,
            maximum_shard_size: 8192,
            shard_trimming_threshold: 1200,
            minimum_active_shards: 24,
            maximum_active_shards: 768,
            backtrack_granularity: 4 * 86400,
            forward_granularity: 86400,
            synchronization_threshold: 62 * 86400,
            synchronization_base_offset: 3600,
            synchronization_everything_base_offset: 300,
            disk_flush_interval: 4000,
            skip_proof_verification: false,
        }
    }
}

// =============================================================================
// ERRORS / RESULTS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database already opened for writing")]
    Locked,
    #[error("database path unusable: {0}")]
    Io(#[from] io::Error),
}

/// Result of assessing a received entry against the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Invalid, don't insert.
    Rejected,
    /// Valid so far, but the named ancestor (parent, or the author's
    /// identity announcement) is missing; buffer and retry on arrival.
    Detached(Eid),
    /// Valid; insert at the node's discretion (subscriptions).
    Classify(Root),
    /// Announcement, insert if at all possible.
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

// =============================================================================
// DATABASE
// =============================================================================

pub struct Db {
    pub settings: Arc<DbSettings>,
    pub path: PathBuf,
    pub mode: Access,

    pub data: Table<Row>,
    pub threads: Table<TRow>,
    pub channels: Table<CRow>,
    pub identities: Table<IRow>,

    pub peers: [PeerSet; LEVELS],

    _lock: Option<File>,
}

impl Db {
    pub fn open(mode: Access, path: &Path, settings: DbSettings) -> Result<Self, DbError> {
        std::fs::create_dir_all(path)?;

        let lock = if mode == Access::ReadWrite {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path.join(".lock"))?;
            match file.try_lock() {
                Ok(()) => Some(file),
                Err(TryLockError::WouldBlock) => return Err(DbError::Locked),
                Err(TryLockError::Error(e)) => return Err(DbError::Io(e)),
            }
        } else {
            None
        };

        let settings = Arc::new(settings);
        let network = path.join("network");
        let db = Self {
            data: Table::new(path, "data", settings.clone()),
            threads: Table::new(path, "threads", settings.clone()),
            channels: Table::new(path, "channels", settings.clone()),
            identities: Table::new(path, "identities", settings.clone()),
            peers: Level::ALL.map(|level| PeerSet::new(&network, level)),
            settings,
            path: path.to_path_buf(),
            mode,
            _lock: lock,
        };

        db.data.reload()?;
        db.threads.reload()?;
        db.channels.reload()?;
        db.identities.reload()?;
        for peers in &db.peers {
            peers.load()?;
        }

        info!(path = %path.display(), ?mode, "database connected");
        Ok(db)
    }

    pub fn stats(&self) -> Statistics {
        let mut stats = Statistics::default();
        stats += self.data.stats();
        stats += self.threads.stats();
        stats += self.channels.stats();
        stats += self.identities.stats();
        stats
    }

    /// Author identity's public key, read from the identity announcement.
    fn author_key(&self, id: &Eid) -> Option<crypto::VerifyingKey> {
        let announcement = self.identities.get_entry(id.identity)?;
        let pk = entry::announced_public_key(&announcement)?;
        crypto::verifying_key(&pk).ok()
    }

    /// Verify proof and signature against identities and parents already
    /// in the database, and derive the denormalized root.
    pub fn assess(&self, bytes: &[u8]) -> Assessment {
        let id = entry::id(bytes);
        let parent = entry::parent(bytes);
        let check_proof = !self.settings.skip_proof_verification;

        match entry::announcement(&id, &parent) {
            Announcement::NewIdentity => {
                if !entry::verify_identity_nonce(bytes, &self.settings.magic) {
                    debug!(code = 2, entry = %id, "identity nonce mismatch");
                    return Assessment::Rejected;
                }
                let Some(key) = entry::announced_public_key(bytes)
                    .and_then(|pk| crypto::verifying_key(&pk).ok())
                else {
                    debug!(code = 2, entry = %id, "identity key malformed");
                    return Assessment::Rejected;
                };
                if !entry::verify_with(bytes, &[], &key, check_proof) {
                    debug!(code = 2, entry = %id, "identity signature invalid");
                    return Assessment::Rejected;
                }
                Assessment::Required
            }

            Announcement::NewChannel => {
                let Some(key) = self.author_key(&id) else {
                    // the author's announcement may still be in flight
                    debug!(code = 5, entry = %id, "author identity unknown, detaching");
                    return Assessment::Detached(Eid::announcement(id.identity));
                };
                if !entry::verify_with(bytes, &[], &key, check_proof) {
                    debug!(code = 6, entry = %id, "channel signature invalid");
                    return Assessment::Rejected;
                }
                Assessment::Required
            }

            Announcement::None => {
                let Some(key) = self.author_key(&id) else {
                    debug!(code = 5, entry = %id, "author identity unknown, detaching");
                    return Assessment::Detached(Eid::announcement(id.identity));
                };

                // the complete parent entry is part of the signature domain
                let Some(parent_bytes) = self.get(&parent) else {
                    debug!(code = 7, entry = %id, "parent not found, detaching");
                    return Assessment::Detached(parent);
                };
                if !entry::verify_with(bytes, &parent_bytes, &key, check_proof) {
                    debug!(code = 6, entry = %id, "signature invalid");
                    return Assessment::Rejected;
                }

                let top = if self.channels.get(parent).is_some()
                    || (parent.timestamp == parent.identity.timestamp
                        && self.identities.get(parent.identity).is_some())
                {
                    // thread in a normal channel or in an identity channel
                    Root {
                        channel: parent,
                        thread: id,
                    }
                } else if let Some(trow) = self.threads.get(parent) {
                    // top level comment within a thread, or vote on it
                    Root {
                        channel: trow.parent,
                        thread: parent,
                    }
                } else if let Some(row) = self.data.get(parent) {
                    // nested comment, vote or stuff
                    row.top()
                } else {
                    return Assessment::Rejected; // parent vanished mid-assess
                };
                Assessment::Classify(top)
            }
        }
    }

    /// Route the entry into the right table. 'exists' reports a duplicate;
    /// duplicates leave the database unchanged.
    pub fn insert(&self, bytes: &[u8], top: &Root, exists: &mut bool) -> io::Result<bool> {
        let id = entry::id(bytes);
        let parent = entry::parent(bytes);

        match entry::announcement(&id, &parent) {
            Announcement::NewIdentity => self.identities.insert(bytes, top, exists),
            Announcement::NewChannel => self.channels.insert(bytes, top, exists),
            Announcement::None => {
                if id == top.thread && parent == top.channel {
                    self.threads.insert(bytes, top, exists)
                } else {
                    self.data.insert(bytes, top, exists)
                }
            }
        }
    }

    /// Reconstruct the complete entry frame by id, whichever table has it.
    pub fn get(&self, id: &Eid) -> Option<Vec<u8>> {
        if id.timestamp != id.identity.timestamp {
            self.data
                .get_entry(*id)
                .or_else(|| self.threads.get_entry(*id))
                .or_else(|| self.channels.get_entry(*id))
        } else {
            // identity announcements and channels riding the announcement
            // timestamp
            self.identities
                .get_entry(id.identity)
                .or_else(|| self.data.get_entry(*id))
                .or_else(|| self.threads.get_entry(*id))
                .or_else(|| self.channels.get_entry(*id))
        }
    }

    /// Administrative, local-only deletion.
    pub fn erase(&self, id: &Eid, thorough: bool) -> io::Result<bool> {
        if id.timestamp == id.identity.timestamp
            && self.identities.erase(id.identity, thorough)?
        {
            return Ok(true);
        }
        if self.data.erase(*id, thorough)? {
            return Ok(true);
        }
        if self.threads.erase(*id, thorough)? {
            return Ok(true);
        }
        self.channels.erase(*id, thorough)
    }

    pub fn flush(&self) {
        self.identities.flush();
        self.channels.flush();
        self.threads.flush();
        self.data.flush();
        for peers in &self.peers {
            peers.save();
        }
    }

    /// Close idle shards; 'strong' prunes down to the minimum, used when
    /// memory is tight.
    pub fn optimize(&self, strong: bool) {
        let mut optimized = 0;
        if self.settings.shard_trimming_threshold != 0 {
            let threshold = now().wrapping_sub(self.settings.shard_trimming_threshold);
            optimized += self.data.optimize(threshold);
            optimized += self.threads.optimize(threshold);
            optimized += self.channels.optimize(threshold);
            optimized += self.identities.optimize(threshold);
        }

        let limit = if strong {
            self.settings.minimum_active_shards
        } else {
            self.settings.maximum_active_shards
        };
        let mut pruned = 0;
        if limit != 0 {
            let active = self.stats().shards_active;
            if active > limit {
                pruned += self.data.prune(limit / 2);
                if active - pruned > limit {
                    pruned += self.threads.prune(limit / 6);
                    pruned += self.channels.prune(limit / 6);
                    pruned += self.identities.prune(limit / 6);
                }
            }
        }

        if optimized != 0 || pruned != 0 {
            debug!(optimized, pruned, "database optimized");
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.mode == Access::ReadWrite {
            self.flush();
        }
    }
}
