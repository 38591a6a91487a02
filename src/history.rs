//! Span-encoded history digest
//!
//! To synchronize a large timeline two nodes exchange a compact summary of
//! how many entries each holds per time span, instead of enumerating ids.
//! A digest is a topmost threshold followed by up to 21 spans walking into
//! the past; each span carries a 24-bit threshold delta and a 24-bit row
//! count, both offset-by-1 encoded. The receiver streams every range where
//! it holds more rows than the digest reports, plus everything newer than
//! the topmost threshold.

use crate::net::request;
use crate::types::{Eid, older};
use std::collections::BTreeMap;

/// Span capacity of a bare (table) digest.
pub const DEPTH: usize = (request::MAX_PAYLOAD - HEADER_SIZE) / SPAN_SIZE;

/// Span capacity of a digest prefixed by a channel eid (subscribe request).
pub const SUBSCRIPTION_DEPTH: usize = (request::MAX_PAYLOAD - Eid::SIZE - HEADER_SIZE) / SPAN_SIZE;

/// Threshold u32 ‖ flags u16.
pub const HEADER_SIZE: usize = 6;

/// A digest with no spans is just the threshold.
pub const MINIMAL_SIZE: usize = 4;

/// Δthreshold u24 ‖ count u24.
pub const SPAN_SIZE: usize = 6;

/// Shard grouping scale for table digests (identities, channels).
pub const TABLE_SCALE: u32 = 4;

/// Row grouping scale for per-channel subscription digests.
pub const CHANNEL_SCALE: u32 = 3;

// =============================================================================
// MODEL
// =============================================================================

/// One span: rows with timestamps in [threshold, next span's threshold).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub threshold: u32,
    pub count: u32,
}

/// Decoded digest. Spans are ordered oldest to newest; everything at or
/// after 'threshold' is implicitly requested in full.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct History {
    pub threshold: u32,
    pub flags: u16,
    pub spans: Vec<Span>,
}

impl History {
    /// Encoded size for a given span count.
    pub const fn size(spans: usize) -> usize {
        if spans > 0 {
            HEADER_SIZE + spans * SPAN_SIZE
        } else {
            MINIMAL_SIZE
        }
    }

    pub fn is_valid_size(size: usize, max_depth: usize) -> bool {
        if size < HEADER_SIZE {
            size == MINIMAL_SIZE
        } else {
            (size - HEADER_SIZE) % SPAN_SIZE == 0
                && (size - HEADER_SIZE) / SPAN_SIZE <= max_depth
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::size(self.spans.len()));
        bytes.extend_from_slice(&self.threshold.to_le_bytes());
        if self.spans.is_empty() {
            return bytes;
        }
        bytes.extend_from_slice(&self.flags.to_le_bytes());

        // deltas are computed newest to oldest, each span relative to the
        // next newer one (or the topmost threshold)
        let mut slots = vec![[0u8; SPAN_SIZE]; self.spans.len()];
        let mut tx = self.threshold;
        for i in (0..self.spans.len()).rev() {
            let delta = tx.wrapping_sub(self.spans[i].threshold).wrapping_sub(1);
            let count = self.spans[i].count.saturating_sub(1).min(0x00FF_FFFF);

            slots[i][0..3].copy_from_slice(&delta.to_le_bytes()[0..3]);
            slots[i][3..6].copy_from_slice(&count.to_le_bytes()[0..3]);
            tx = self.spans[i].threshold;
        }
        for slot in slots {
            bytes.extend_from_slice(&slot);
        }
        bytes
    }

    pub fn decode(bytes: &[u8], max_depth: usize) -> Option<Self> {
        if !Self::is_valid_size(bytes.len(), max_depth) {
            return None;
        }
        let threshold = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        if bytes.len() == MINIMAL_SIZE {
            return Some(Self {
                threshold,
                flags: 0,
                spans: Vec::new(),
            });
        }
        let flags = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
        let count = (bytes.len() - HEADER_SIZE) / SPAN_SIZE;

        let mut spans = vec![
            Span {
                threshold: 0,
                count: 0,
            };
            count
        ];
        let mut tx = threshold;
        for i in (0..count).rev() {
            let slot = &bytes[HEADER_SIZE + i * SPAN_SIZE..HEADER_SIZE + (i + 1) * SPAN_SIZE];
            let delta = u32::from_le_bytes([slot[0], slot[1], slot[2], 0]);
            let number = u32::from_le_bytes([slot[3], slot[4], slot[5], 0]);

            spans[i] = Span {
                threshold: tx.wrapping_sub(delta).wrapping_sub(1),
                count: number + 1,
            };
            tx = spans[i].threshold;
        }
        Some(Self {
            threshold,
            flags,
            spans,
        })
    }

    /// Inclusive timestamp ranges with the peer's reported row counts,
    /// oldest first.
    pub fn ranges(&self) -> BTreeMap<(u32, u32), u32> {
        let mut map = BTreeMap::new();
        for (i, span) in self.spans.iter().enumerate() {
            let next = self
                .spans
                .get(i + 1)
                .map(|s| s.threshold)
                .unwrap_or(self.threshold);
            map.insert((span.threshold, next.wrapping_sub(1)), span.count);
        }
        map
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Accumulates (timestamp, row count) sources, oldest to newest, grouping
/// them into spans that each cover roughly 1/scale of the remaining range
/// up to now.
///
/// The newest group is never transmitted as a span: its base becomes the
/// digest threshold and the peer streams everything at or after it anyway.
pub struct HistoryBuilder {
    now: u32,
    scale: u32,
    threshold: u32,
    thresholds: Vec<u32>,
    counts: Vec<u64>,
    full: bool,
    depth: usize,
}

impl HistoryBuilder {
    pub fn new(now: u32, scale: u32, depth: usize) -> Self {
        Self {
            now,
            scale,
            threshold: 0,
            thresholds: Vec::new(),
            counts: Vec::new(),
            full: false,
            depth,
        }
    }

    /// Add a source; returns false once the digest depth is exhausted and
    /// accumulation should stop.
    pub fn push(&mut self, timestamp: u32, rows: u64) -> bool {
        if self.full {
            return false;
        }
        if self.thresholds.is_empty() {
            self.threshold = timestamp;
            self.thresholds.push(timestamp);
            self.counts.push(rows);
            return true;
        }

        let pivot = self
            .threshold
            .wrapping_add(self.now.wrapping_sub(self.threshold) / self.scale)
            .wrapping_add(1);
        if older(timestamp, pivot) {
            if let Some(last) = self.counts.last_mut() {
                *last += rows;
            }
        } else if self.thresholds.len() <= self.depth {
            self.threshold = timestamp;
            self.thresholds.push(timestamp);
            self.counts.push(rows);
        } else {
            self.full = true;
            return false;
        }
        true
    }

    /// Finish the digest; 'empty_threshold' is reported when nothing was
    /// accumulated at all.
    pub fn finish(self, empty_threshold: u32) -> History {
        if self.thresholds.is_empty() {
            return History {
                threshold: empty_threshold,
                flags: 0,
                spans: Vec::new(),
            };
        }
        let transmitted = self.thresholds.len() - 1;
        History {
            threshold: self.threshold,
            flags: 0,
            spans: self
                .thresholds
                .iter()
                .zip(&self.counts)
                .take(transmitted)
                .map(|(&threshold, &count)| Span {
                    threshold,
                    count: count.min(0x0100_0000) as u32,
                })
                .collect(),
        }
    }
}

// =============================================================================
// SUBSCRIPTION PACKET
// =============================================================================

/// Subscribe request payload: channel eid followed by the digest of what
/// the subscriber already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel: Eid,
    pub history: History,
}

impl Subscription {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Eid::SIZE + History::size(self.history.spans.len()));
        bytes.extend_from_slice(&self.channel.to_bytes());
        bytes.extend_from_slice(&self.history.to_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Eid::SIZE {
            return None;
        }
        Some(Self {
            channel: Eid::read_from(&bytes[0..Eid::SIZE]),
            history: History::decode(&bytes[Eid::SIZE..], SUBSCRIPTION_DEPTH)?,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Iid;

    #[test]
    fn test_depths() {
        assert_eq!(DEPTH, 21);
        assert_eq!(SUBSCRIPTION_DEPTH, 19);
    }

    #[test]
    fn test_empty_digest() {
        let builder = HistoryBuilder::new(1_000_000, TABLE_SCALE, DEPTH);
        let digest = builder.finish(42);
        assert_eq!(digest.threshold, 42);
        assert!(digest.spans.is_empty());

        let bytes = digest.to_bytes();
        assert_eq!(bytes.len(), MINIMAL_SIZE);
        assert_eq!(History::decode(&bytes, DEPTH).unwrap(), digest);
    }

    #[test]
    fn test_wire_roundtrip() {
        let now = 10_000_000;
        let mut builder = HistoryBuilder::new(now, TABLE_SCALE, DEPTH);
        // shards at T-86400, T-3600, T-60 with 1000, 500, 5 rows
        assert!(builder.push(now - 86_400, 1000));
        assert!(builder.push(now - 3_600, 500));
        assert!(builder.push(now - 60, 5));
        let digest = builder.finish(0);

        // newest group becomes the threshold, its 5 rows are implied
        assert_eq!(digest.threshold, now - 60);
        assert_eq!(digest.spans.len(), 2);
        assert_eq!(digest.spans[0].count, 1000);
        assert_eq!(digest.spans[1].count, 500);

        let bytes = digest.to_bytes();
        assert_eq!(bytes.len(), History::size(2));
        let decoded = History::decode(&bytes, DEPTH).unwrap();
        assert_eq!(decoded, digest);

        let ranges = decoded.ranges();
        assert_eq!(
            ranges.get(&(now - 86_400, now - 3_601)).copied(),
            Some(1000)
        );
        assert_eq!(ranges.get(&(now - 3_600, now - 61)).copied(), Some(500));
    }

    #[test]
    fn test_close_sources_collapse_to_threshold() {
        let now = 1_000_000;
        let mut builder = HistoryBuilder::new(now, TABLE_SCALE, DEPTH);
        // all three bases fall within the first quarter of the remaining
        // range, so they form a single group: bare threshold, no spans
        assert!(builder.push(100, 10));
        assert!(builder.push(110, 20));
        assert!(builder.push(120, 30));
        let digest = builder.finish(0);

        assert!(digest.spans.is_empty());
        assert_eq!(digest.threshold, 100);
    }

    #[test]
    fn test_depth_exhaustion_stops_accumulation() {
        let now = u32::MAX / 2;
        let mut builder = HistoryBuilder::new(now, TABLE_SCALE, 1);
        assert!(builder.push(100, 1));
        // far enough apart to start new groups every time
        assert!(builder.push(now / 2, 1));
        assert!(!builder.push(now - 10, 1));
        let digest = builder.finish(0);
        assert_eq!(digest.spans.len(), 1);
        assert_eq!(digest.threshold, now / 2);
    }

    #[test]
    fn test_size_validation() {
        assert!(History::is_valid_size(4, DEPTH));
        assert!(!History::is_valid_size(5, DEPTH));
        assert!(History::is_valid_size(6, DEPTH));
        assert!(History::is_valid_size(6 + 21 * 6, DEPTH));
        assert!(!History::is_valid_size(6 + 22 * 6, DEPTH));
        assert!(!History::is_valid_size(7, DEPTH));
    }

    #[test]
    fn test_subscription_roundtrip() {
        let channel = Eid {
            timestamp: 5000,
            identity: Iid {
                timestamp: 4000,
                nonce: 77,
            },
        };
        let mut builder = HistoryBuilder::new(100_000, CHANNEL_SCALE, SUBSCRIPTION_DEPTH);
        builder.push(50_000, 12);
        let packet = Subscription {
            channel,
            history: builder.finish(0),
        };

        let bytes = packet.to_bytes();
        assert_eq!(Subscription::decode(&bytes).unwrap(), packet);
    }
}
