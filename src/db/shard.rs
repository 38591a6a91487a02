//! Table shard
//!
//! A shard covers a contiguous timestamp interval starting at 'base' and is
//! stored as two files: `<base>.idx` with fixed-size rows in insertion
//! order, and `<base>.dat` with `signature ‖ body` records the rows point
//! into. The in-memory cache keeps rows sorted by id, erased rows last.
//!
//! Crash ordering: the content record is written before the index row, so
//! a row never points past the end of the content file; rows that do (a
//! torn write on the content side) are dropped at load.

use super::row::{DbRow, Root};
use crate::entry;
use crate::types::now;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

pub struct Shard<K: DbRow> {
    pub base: u32,
    accessed: AtomicU32,
    state: Mutex<State<K>>,
}

struct State<K> {
    index: Option<File>,
    content: Option<File>,
    cache: Vec<K>,
    deleted: u32,
}

fn index_path(dir: &Path, base: u32) -> PathBuf {
    dir.join(format!("{base}.idx"))
}

fn content_path(dir: &Path, base: u32) -> PathBuf {
    dir.join(format!("{base}.dat"))
}

impl<K: DbRow> Shard<K> {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            accessed: AtomicU32::new(now()),
            state: Mutex::new(State {
                index: None,
                content: None,
                cache: Vec::new(),
                deleted: 0,
            }),
        }
    }

    pub fn accessed(&self) -> u32 {
        self.accessed.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().index.is_none()
    }

    /// Frees the cache and closes file handles.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.index.is_none() {
            return false;
        }
        state.index = None;
        state.content = None;
        state.cache = Vec::new();
        state.deleted = 0;
        true
    }

    /// Row count without forcing the shard open; uses the index file size
    /// for closed shards, so recently deleted rows may still be counted.
    pub fn size_hint(&self, dir: &Path) -> usize {
        let state = self.state.lock().unwrap();
        if state.index.is_some() {
            state.cache.len() - state.deleted as usize
        } else {
            std::fs::metadata(index_path(dir, self.base))
                .map(|m| m.len() as usize / K::SIZE)
                .unwrap_or(0)
        }
    }

    pub fn size(&self, dir: &Path) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;
        Ok(state.cache.len() - state.deleted as usize)
    }

    /// Latest (youngest) live row.
    pub fn top(&self, dir: &Path) -> io::Result<Option<K>> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;
        let live = state.cache.len() - state.deleted as usize;
        Ok(if live > 0 {
            Some(state.cache[live - 1])
        } else {
            None
        })
    }

    fn require_open(&self, dir: &Path, state: &mut State<K>) -> io::Result<()> {
        self.accessed.store(now(), Ordering::Relaxed);
        if state.index.is_some() {
            return Ok(());
        }

        let mut index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(index_path(dir, self.base))?;
        let content = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(content_path(dir, self.base))?;
        let content_size = content.metadata()?.len();

        let mut bytes = Vec::new();
        index.read_to_end(&mut bytes)?;

        let mut cache = Vec::with_capacity(bytes.len() / K::SIZE);
        let mut deleted = 0u32;
        for chunk in bytes.chunks_exact(K::SIZE) {
            let row = K::read_from(chunk);
            let (offset, length) = row.location();
            if offset + crate::crypto::SIGNATURE_SIZE as u64 + length as u64 > content_size {
                warn!(base = self.base, "dropping index row past content end");
                continue;
            }
            if row.erased() {
                deleted += 1;
            }
            cache.push(row);
        }
        cache.sort_by_key(|row| row.sort_key());

        state.index = Some(index);
        state.content = Some(content);
        state.cache = cache;
        state.deleted = deleted;
        Ok(())
    }

    fn find(state: &State<K>, id: K::Id) -> Option<usize> {
        let live = state.cache.len() - state.deleted as usize;
        state.cache[..live]
            .binary_search_by_key(&(false, id), |row| row.sort_key())
            .ok()
    }

    /// Insert a whole decoded entry frame. Sets 'exists' when the id is
    /// already present and leaves the shard unchanged.
    pub fn insert(
        &self,
        dir: &Path,
        bytes: &[u8],
        top: &Root,
        exists: &mut bool,
    ) -> io::Result<bool> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;

        let Some(mut row) = K::classify(bytes, top) else {
            return Ok(false);
        };
        if Self::find(&state, row.id()).is_some() {
            *exists = true;
            return Ok(true);
        }
        *exists = false;

        let body = &bytes[entry::HEADER_SIZE..];
        let signature = &bytes[24..88];

        let content = state.content.as_mut().expect("opened above");
        let offset = content.seek(SeekFrom::End(0))?;
        content.write_all(signature)?;
        content.write_all(body)?;

        if !row.locate(offset, body.len()) {
            return Ok(false);
        }

        let index = state.index.as_mut().expect("opened above");
        let mut buffer = vec![0u8; K::SIZE];
        row.write_to(&mut buffer);
        index.seek(SeekFrom::End(0))?;
        index.write_all(&buffer)?;

        let position = state
            .cache
            .partition_point(|existing| existing.sort_key() < row.sort_key());
        state.cache.insert(position, row);
        Ok(true)
    }

    pub fn get(&self, dir: &Path, id: K::Id) -> io::Result<Option<K>> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;
        Ok(Self::find(&state, id).map(|i| state.cache[i]))
    }

    /// Reconstruct the complete entry frame for transmission.
    pub fn get_entry(&self, dir: &Path, id: K::Id) -> io::Result<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;
        let Some(position) = Self::find(&state, id) else {
            return Ok(None);
        };
        let row = state.cache[position];
        Ok(Some(Self::read_entry(&mut state, &row)?))
    }

    fn read_entry(state: &mut State<K>, row: &K) -> io::Result<Vec<u8>> {
        let (offset, length) = row.location();
        let content = state.content.as_mut().expect("caller opened the shard");

        let mut record = vec![0u8; crate::crypto::SIGNATURE_SIZE + length];
        content.seek(SeekFrom::Start(offset))?;
        content.read_exact(&mut record)?;

        let mut bytes = vec![0u8; entry::HEADER_SIZE + length];
        row.eid().write_to(&mut bytes[0..12]);
        row.parent().write_to(&mut bytes[12..24]);
        bytes[24..].copy_from_slice(&record);
        Ok(bytes)
    }

    /// Overwrite the row id with zeros; with 'thorough' also the content
    /// record. The row stays in cache and file so positions are stable.
    pub fn erase(&self, dir: &Path, id: K::Id, thorough: bool) -> io::Result<bool> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;
        let Some(position) = Self::find(&state, id) else {
            return Ok(false);
        };

        let mut erased = state.cache.remove(position);
        let (offset, length) = erased.location();
        erased.erase();
        state.cache.push(erased);
        state.deleted += 1;

        // locate the row in the insertion-ordered index file
        let index = state.index.as_mut().expect("opened above");
        index.seek(SeekFrom::Start(0))?;
        let mut file_bytes = Vec::new();
        index.read_to_end(&mut file_bytes)?;

        let mut buffer = vec![0u8; K::SIZE];
        erased.write_to(&mut buffer);
        for (slot, chunk) in file_bytes.chunks_exact(K::SIZE).enumerate() {
            if K::read_from(chunk).id() == id {
                index.seek(SeekFrom::Start((slot * K::SIZE) as u64))?;
                index.write_all(&buffer)?;
                break;
            }
        }

        if thorough {
            let content = state.content.as_mut().expect("opened above");
            let zeros = vec![0u8; crate::crypto::SIGNATURE_SIZE + length];
            content.seek(SeekFrom::Start(offset))?;
            content.write_all(&zeros)?;
        }
        Ok(true)
    }

    /// Move rows at or newer than 'timestamp' into a new shard based
    /// there. The old content file keeps stale records; they are simply no
    /// longer referenced.
    pub fn split(&self, dir: &Path, timestamp: u32) -> io::Result<Shard<K>> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;

        let live = state.cache.len() - state.deleted as usize;
        let cut = state.cache[..live].partition_point(|row| row.timestamp() < timestamp);
        let moved: Vec<K> = state.cache[cut..live].to_vec();

        let newer = Shard::new(timestamp);
        {
            let mut newer_state = newer.state.lock().unwrap();
            newer.require_open(dir, &mut newer_state)?;

            for mut row in moved {
                let record = {
                    let (offset, length) = row.location();
                    let content = state.content.as_mut().expect("opened above");
                    let mut record = vec![0u8; crate::crypto::SIGNATURE_SIZE + length];
                    content.seek(SeekFrom::Start(offset))?;
                    content.read_exact(&mut record)?;
                    record
                };

                let content = newer_state.content.as_mut().expect("opened above");
                let offset = content.seek(SeekFrom::End(0))?;
                content.write_all(&record)?;
                row.locate(offset, record.len() - crate::crypto::SIGNATURE_SIZE);

                let index = newer_state.index.as_mut().expect("opened above");
                let mut buffer = vec![0u8; K::SIZE];
                row.write_to(&mut buffer);
                index.seek(SeekFrom::End(0))?;
                index.write_all(&buffer)?;
                newer_state.cache.push(row);
            }
            newer_state.cache.sort_by_key(|row| row.sort_key());
        }

        // rewrite our index without the moved rows
        let mut remaining: Vec<K> = state.cache[..cut].to_vec();
        remaining.extend_from_slice(&state.cache[live..]); // erased tail stays
        let index = state.index.as_mut().expect("opened above");
        index.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; K::SIZE];
        for row in &remaining {
            row.write_to(&mut buffer);
            index.write_all(&buffer)?;
        }
        index.set_len((remaining.len() * K::SIZE) as u64)?;
        index.seek(SeekFrom::End(0))?;
        state.cache = remaining;

        debug!(
            base = self.base,
            split = timestamp,
            "shard split"
        );
        Ok(newer)
    }

    /// Iterate live rows with id timestamps in [oldest, latest]. Rows
    /// passing 'constrain' are counted; those 'query' also approves are
    /// read in full and handed to 'callback'.
    pub fn select(
        &self,
        dir: &Path,
        oldest: u32,
        latest: u32,
        constrain: &mut dyn FnMut(&K) -> bool,
        query: &mut dyn FnMut(&K) -> bool,
        callback: &mut dyn FnMut(&K, &[u8]) -> bool,
    ) -> io::Result<(usize, bool)> {
        let mut state = self.state.lock().unwrap();
        self.require_open(dir, &mut state)?;

        let live = state.cache.len() - state.deleted as usize;
        let start = state.cache[..live].partition_point(|row| row.timestamp() < oldest);

        let mut matched = 0;
        for position in start..live {
            let row = state.cache[position];
            if row.timestamp() > latest {
                break;
            }
            if !constrain(&row) {
                continue;
            }
            matched += 1;
            if query(&row) {
                let bytes = Self::read_entry(&mut state, &row)?;
                if !callback(&row, &bytes) {
                    return Ok((matched, false));
                }
            }
        }
        Ok((matched, true))
    }

    pub fn flush(&self) {
        let state = self.state.lock().unwrap();
        if let Some(index) = &state.index {
            index.sync_all().ok();
        }
        if let Some(content) = &state.content {
            content.sync_all().ok();
        }
    }
}
