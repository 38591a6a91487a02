//! Index row layouts
//!
//! Each table stores fixed-size rows in the shard index file; signatures
//! and content live in the shard content file. Announcement tables use
//! narrow offsets since their bodies are tightly bounded by consensus.

use crate::consensus;
use crate::entry;
use crate::proof;
use crate::types::{Eid, Iid};

/// Denormalized top-level references kept per row so channel and thread
/// queries are answered from the data table alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Root {
    pub channel: Eid,
    pub thread: Eid,
}

/// Light content classification to speed up searches.
fn summarize(content: &[u8]) -> u32 {
    let mut summary = 0u32;
    if content.iter().any(|b| *b >= 0x20) {
        summary |= 0x01; // textual payload
    }
    if content.iter().any(|b| *b < 0x20 && *b != 0) {
        summary |= 0x02; // control/binary payload
    }
    if content.len() <= 4 {
        summary |= 0x04; // vote-sized
    }
    summary
}

/// Operations every table row supports. Rows are compared by id; an erased
/// row has its id zeroed and sorts after every live row so binary search
/// over the cache keeps working.
pub trait DbRow: Copy {
    type Id: Copy + Ord + std::fmt::Debug;

    const SIZE: usize;

    /// Largest body (content ‖ proof, signature excluded) a row can address.
    const MAX_BODY: usize;

    fn id(&self) -> Self::Id;
    fn lookup_id(eid: &Eid) -> Self::Id;

    /// Timestamp component of a lookup id, drives shard selection.
    fn id_timestamp(id: &Self::Id) -> u32;

    /// Timestamp component of the row id, drives shard placement.
    fn timestamp(&self) -> u32;
    fn eid(&self) -> Eid;
    fn parent(&self) -> Eid;
    fn top(&self) -> Root;

    /// Parse the entry and initialize everything but the data location.
    /// None when the entry cannot live in this table.
    fn classify(bytes: &[u8], top: &Root) -> Option<Self>;

    /// Record where the body was stored; false when it does not fit the
    /// row's offset/length fields.
    fn locate(&mut self, offset: u64, length: usize) -> bool;
    fn location(&self) -> (u64, usize);

    fn erased(&self) -> bool;
    fn erase(&mut self);

    fn write_to(&self, buffer: &mut [u8]);
    fn read_from(buffer: &[u8]) -> Self;

    /// Sort key placing erased rows last.
    fn sort_key(&self) -> (bool, Self::Id) {
        (self.erased(), self.id())
    }
}

// =============================================================================
// ROW — data table
// =============================================================================

/// General data entry row: full id/parent pair, 48/16-bit body location,
/// denormalized root and a content classification bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Row {
    pub id: Eid,
    pub parent: Eid,
    pub data: u64, // offset:48 | length:16
    pub top_: Root,
    pub summary: u32,
}

const OFFSET_MASK: u64 = (1 << 48) - 1;

impl DbRow for Row {
    type Id = Eid;

    const SIZE: usize = 60;
    const MAX_BODY: usize = u16::MAX as usize;

    fn id(&self) -> Eid {
        self.id
    }
    fn lookup_id(eid: &Eid) -> Eid {
        *eid
    }
    fn id_timestamp(id: &Eid) -> u32 {
        id.timestamp
    }
    fn timestamp(&self) -> u32 {
        self.id.timestamp
    }
    fn eid(&self) -> Eid {
        self.id
    }
    fn parent(&self) -> Eid {
        self.parent
    }
    fn top(&self) -> Root {
        self.top_
    }

    fn classify(bytes: &[u8], top: &Root) -> Option<Self> {
        Some(Self {
            id: entry::id(bytes),
            parent: entry::parent(bytes),
            data: 0,
            top_: *top,
            summary: summarize(entry::content(bytes)),
        })
    }

    fn locate(&mut self, offset: u64, length: usize) -> bool {
        if offset > OFFSET_MASK || length > Self::MAX_BODY {
            return false;
        }
        self.data = offset | ((length as u64) << 48);
        true
    }
    fn location(&self) -> (u64, usize) {
        (self.data & OFFSET_MASK, (self.data >> 48) as usize)
    }

    fn erased(&self) -> bool {
        self.id.is_null() && self.parent.is_null()
    }
    fn erase(&mut self) {
        self.id = Eid::default();
        self.parent = Eid::default();
    }

    fn write_to(&self, buffer: &mut [u8]) {
        self.id.write_to(&mut buffer[0..12]);
        self.parent.write_to(&mut buffer[12..24]);
        buffer[24..32].copy_from_slice(&self.data.to_le_bytes());
        self.top_.channel.write_to(&mut buffer[32..44]);
        self.top_.thread.write_to(&mut buffer[44..56]);
        buffer[56..60].copy_from_slice(&self.summary.to_le_bytes());
    }

    fn read_from(buffer: &[u8]) -> Self {
        Self {
            id: Eid::read_from(&buffer[0..12]),
            parent: Eid::read_from(&buffer[12..24]),
            data: u64::from_le_bytes(buffer[24..32].try_into().unwrap_or_default()),
            top_: Root {
                channel: Eid::read_from(&buffer[32..44]),
                thread: Eid::read_from(&buffer[44..56]),
            },
            summary: u32::from_le_bytes(buffer[56..60].try_into().unwrap_or_default()),
        }
    }
}

// =============================================================================
// TROW — threads table
// =============================================================================

/// Thread row; root is derived, not stored: the parent is the channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TRow {
    pub id: Eid,
    pub parent: Eid,
    pub data: u64,
}

impl DbRow for TRow {
    type Id = Eid;

    const SIZE: usize = 32;
    const MAX_BODY: usize = u16::MAX as usize;

    fn id(&self) -> Eid {
        self.id
    }
    fn lookup_id(eid: &Eid) -> Eid {
        *eid
    }
    fn id_timestamp(id: &Eid) -> u32 {
        id.timestamp
    }
    fn timestamp(&self) -> u32 {
        self.id.timestamp
    }
    fn eid(&self) -> Eid {
        self.id
    }
    fn parent(&self) -> Eid {
        self.parent
    }
    fn top(&self) -> Root {
        Root {
            channel: self.parent,
            thread: self.id,
        }
    }

    fn classify(bytes: &[u8], _top: &Root) -> Option<Self> {
        Some(Self {
            id: entry::id(bytes),
            parent: entry::parent(bytes),
            data: 0,
        })
    }

    fn locate(&mut self, offset: u64, length: usize) -> bool {
        if offset > OFFSET_MASK || length > Self::MAX_BODY {
            return false;
        }
        self.data = offset | ((length as u64) << 48);
        true
    }
    fn location(&self) -> (u64, usize) {
        (self.data & OFFSET_MASK, (self.data >> 48) as usize)
    }

    fn erased(&self) -> bool {
        self.id.is_null() && self.parent.is_null()
    }
    fn erase(&mut self) {
        self.id = Eid::default();
        self.parent = Eid::default();
    }

    fn write_to(&self, buffer: &mut [u8]) {
        self.id.write_to(&mut buffer[0..12]);
        self.parent.write_to(&mut buffer[12..24]);
        buffer[24..32].copy_from_slice(&self.data.to_le_bytes());
    }

    fn read_from(buffer: &[u8]) -> Self {
        Self {
            id: Eid::read_from(&buffer[0..12]),
            parent: Eid::read_from(&buffer[12..24]),
            data: u64::from_le_bytes(buffer[24..32].try_into().unwrap_or_default()),
        }
    }
}

// =============================================================================
// CROW — channels table
// =============================================================================

/// Channel announcement row. Bodies are bounded by the channel name limit
/// plus the largest proof, so 8 bits of length suffice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CRow {
    pub id: Eid,
    pub data: u32, // offset:24 | length:8
}

const NARROW_OFFSET_MASK: u32 = (1 << 24) - 1;
const NARROW_MAX_BODY: usize = u8::MAX as usize;

const _: () = assert!(NARROW_MAX_BODY > consensus::MAX_CHANNEL_NAME_SIZE + proof::MAX_SIZE);
const _: () = assert!(
    NARROW_MAX_BODY
        > entry::IDENTITY_OVERHEAD + consensus::MAX_IDENTITY_NAME_SIZE + proof::MAX_SIZE
);

impl DbRow for CRow {
    type Id = Eid;

    const SIZE: usize = 16;
    const MAX_BODY: usize = NARROW_MAX_BODY;

    fn id(&self) -> Eid {
        self.id
    }
    fn lookup_id(eid: &Eid) -> Eid {
        *eid
    }
    fn id_timestamp(id: &Eid) -> u32 {
        id.timestamp
    }
    fn timestamp(&self) -> u32 {
        self.id.timestamp
    }
    fn eid(&self) -> Eid {
        self.id
    }
    fn parent(&self) -> Eid {
        self.id
    }
    fn top(&self) -> Root {
        Root {
            channel: self.id,
            thread: self.id,
        }
    }

    fn classify(bytes: &[u8], _top: &Root) -> Option<Self> {
        if bytes.len() >= entry::HEADER_SIZE + (1 << 8) {
            return None;
        }
        Some(Self {
            id: entry::id(bytes),
            data: 0,
        })
    }

    fn locate(&mut self, offset: u64, length: usize) -> bool {
        if offset > NARROW_OFFSET_MASK as u64 || length > Self::MAX_BODY {
            return false;
        }
        self.data = offset as u32 | ((length as u32) << 24);
        true
    }
    fn location(&self) -> (u64, usize) {
        ((self.data & NARROW_OFFSET_MASK) as u64, (self.data >> 24) as usize)
    }

    fn erased(&self) -> bool {
        self.id.is_null()
    }
    fn erase(&mut self) {
        self.id = Eid::default();
    }

    fn write_to(&self, buffer: &mut [u8]) {
        self.id.write_to(&mut buffer[0..12]);
        buffer[12..16].copy_from_slice(&self.data.to_le_bytes());
    }

    fn read_from(buffer: &[u8]) -> Self {
        Self {
            id: Eid::read_from(&buffer[0..12]),
            data: u32::from_le_bytes(buffer[12..16].try_into().unwrap_or_default()),
        }
    }
}

// =============================================================================
// IROW — identities table
// =============================================================================

/// Identity announcement row, keyed by iid alone: four times less data to
/// load than a full row, and identities need to load fast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IRow {
    pub id: Iid,
    pub data: u32, // offset:24 | length:8
}

impl DbRow for IRow {
    type Id = Iid;

    const SIZE: usize = 12;
    const MAX_BODY: usize = NARROW_MAX_BODY;

    fn id(&self) -> Iid {
        self.id
    }
    fn lookup_id(eid: &Eid) -> Iid {
        eid.identity
    }
    fn id_timestamp(id: &Iid) -> u32 {
        id.timestamp
    }
    fn timestamp(&self) -> u32 {
        self.id.timestamp
    }
    fn eid(&self) -> Eid {
        Eid::announcement(self.id)
    }
    fn parent(&self) -> Eid {
        Eid::announcement(self.id)
    }
    fn top(&self) -> Root {
        Root {
            channel: self.eid(),
            thread: self.eid(),
        }
    }

    fn classify(bytes: &[u8], _top: &Root) -> Option<Self> {
        if bytes.len() >= entry::HEADER_SIZE + (1 << 8) {
            return None;
        }
        Some(Self {
            id: entry::id(bytes).identity,
            data: 0,
        })
    }

    fn locate(&mut self, offset: u64, length: usize) -> bool {
        if offset > NARROW_OFFSET_MASK as u64 || length > Self::MAX_BODY {
            return false;
        }
        self.data = offset as u32 | ((length as u32) << 24);
        true
    }
    fn location(&self) -> (u64, usize) {
        ((self.data & NARROW_OFFSET_MASK) as u64, (self.data >> 24) as usize)
    }

    fn erased(&self) -> bool {
        self.id.is_null()
    }
    fn erase(&mut self) {
        self.id = Iid::default();
    }

    fn write_to(&self, buffer: &mut [u8]) {
        self.id.write_to(&mut buffer[0..8]);
        buffer[8..12].copy_from_slice(&self.data.to_le_bytes());
    }

    fn read_from(buffer: &[u8]) -> Self {
        Self {
            id: Iid::read_from(&buffer[0..8]),
            data: u32::from_le_bytes(buffer[8..12].try_into().unwrap_or_default()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_binary_roundtrip() {
        let row = Row {
            id: Eid {
                timestamp: 100,
                identity: Iid {
                    timestamp: 50,
                    nonce: 7,
                },
            },
            parent: Eid {
                timestamp: 90,
                identity: Iid {
                    timestamp: 40,
                    nonce: 8,
                },
            },
            data: 0,
            top_: Root::default(),
            summary: 0x05,
        };
        let mut row = row;
        assert!(row.locate(123_456, 789));

        let mut buffer = [0u8; Row::SIZE];
        row.write_to(&mut buffer);
        assert_eq!(Row::read_from(&buffer), row);
        assert_eq!(row.location(), (123_456, 789));
    }

    #[test]
    fn test_narrow_row_location_limits() {
        let mut row = CRow::default();
        assert!(row.locate(0x00FF_FFFF, 255));
        assert_eq!(row.location(), (0x00FF_FFFF, 255));
        assert!(!row.locate(0x0100_0000, 10));
        assert!(!row.locate(10, 256));
    }

    #[test]
    fn test_erased_rows_sort_last() {
        let live = Row {
            id: Eid {
                timestamp: u32::MAX,
                identity: Iid {
                    timestamp: u32::MAX,
                    nonce: u32::MAX,
                },
            },
            ..Row::default()
        };
        let mut erased = live;
        erased.erase();

        assert!(erased.erased());
        assert!(live.sort_key() < erased.sort_key());
    }

    #[test]
    fn test_irow_keyed_by_identity() {
        let eid = Eid {
            timestamp: 77,
            identity: Iid {
                timestamp: 77,
                nonce: 3,
            },
        };
        assert_eq!(IRow::lookup_id(&eid), eid.identity);
    }
}
