//! Core identifiers and the network timestamp
//!
//! All timestamps on the wire and in the database are 32-bit seconds since
//! 2020-01-01 00:00:00 UTC. Comparisons use modular-age arithmetic so the
//! network survives the eventual wrap-around.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix timestamp of 2020-01-01 00:00:00 UTC, the network epoch.
pub const TIMESTAMP_BASE: u64 = 1_577_836_800;

/// Current network timestamp, seconds since the 2020 epoch.
pub fn now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    unix.saturating_sub(TIMESTAMP_BASE) as u32
}

/// Current network timestamp in microseconds since the 2020 epoch.
pub fn microtimestamp() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    unix.saturating_sub(TIMESTAMP_BASE * 1_000_000)
}

/// True if 'timestamp' is older than 'reference', wrap-around aware.
#[inline]
pub fn older(timestamp: u32, reference: u32) -> bool {
    timestamp.wrapping_sub(reference) > 0x8000_0000
}

/// True if 'microtimestamp' is older than 'reference', wrap-around aware.
#[inline]
pub fn older64(microtimestamp: u64, reference: u64) -> bool {
    microtimestamp.wrapping_sub(reference) > 0x8000_0000_0000_0000
}

// =============================================================================
// IID
// =============================================================================

/// Identity (user account) identifier.
///
/// The nonce is a short keyed hash of the identity's public key, preventing
/// creation of colliding vanity identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Iid {
    pub timestamp: u32,
    pub nonce: u32,
}

impl Iid {
    pub const SIZE: usize = 8;

    /// Inclusive range of valid textual representation lengths.
    pub const MIN_TEXT: usize = 9;
    pub const MAX_TEXT: usize = 16;

    /// Both members zero; null, invalid, special meaning.
    pub fn is_null(&self) -> bool {
        self.timestamp == 0 && self.nonce == 0
    }

    /// Deletion within database is done by zeroing the record.
    pub fn erased(&self) -> bool {
        self.is_null()
    }

    pub fn write_to(&self, buffer: &mut [u8]) {
        buffer[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.nonce.to_le_bytes());
    }

    pub fn read_from(buffer: &[u8]) -> Self {
        Self {
            timestamp: u32::from_le_bytes(buffer[0..4].try_into().unwrap_or_default()),
            nonce: u32::from_le_bytes(buffer[4..8].try_into().unwrap_or_default()),
        }
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}{:x}", self.nonce, self.timestamp)
    }
}

impl FromStr for Iid {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start();
        if s.len() < Self::MIN_TEXT || !s.is_ascii() {
            return Err(IdParseError);
        }
        let nonce = u32::from_str_radix(&s[0..8], 16).map_err(|_| IdParseError)?;
        let rest: String = s[8..]
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .take(8)
            .collect();
        if rest.is_empty() {
            return Err(IdParseError);
        }
        let timestamp = u32::from_str_radix(&rest, 16).map_err(|_| IdParseError)?;
        Ok(Self { timestamp, nonce })
    }
}

// =============================================================================
// EID
// =============================================================================

/// Entry identifier: creation time plus the author's identity.
///
/// For an identity announcement `timestamp == identity.timestamp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Eid {
    pub timestamp: u32,
    pub identity: Iid,
}

impl Eid {
    pub const SIZE: usize = 12;

    /// Derives the creation-announcing eid of an identity.
    pub fn announcement(identity: Iid) -> Self {
        Self {
            timestamp: identity.timestamp,
            identity,
        }
    }

    pub fn is_null(&self) -> bool {
        self.timestamp == 0 && self.identity.is_null()
    }

    pub fn erased(&self) -> bool {
        self.is_null()
    }

    pub fn write_to(&self, buffer: &mut [u8]) {
        buffer[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        self.identity.write_to(&mut buffer[4..12]);
    }

    pub fn read_from(buffer: &[u8]) -> Self {
        Self {
            timestamp: u32::from_le_bytes(buffer[0..4].try_into().unwrap_or_default()),
            identity: Iid::read_from(&buffer[4..12]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        self.write_to(&mut b);
        b
    }
}

impl From<Iid> for Eid {
    fn from(identity: Iid) -> Self {
        Self::announcement(identity)
    }
}

impl PartialOrd for Eid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Eid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.identity).cmp(&(other.timestamp, other.identity))
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:x}", self.identity, self.timestamp)
    }
}

impl FromStr for Eid {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start();
        let dash = s.find('-').ok_or(IdParseError)?;
        let identity: Iid = s[..dash].parse()?;
        let timestamp =
            u32::from_str_radix(s[dash + 1..].trim(), 16).map_err(|_| IdParseError)?;
        Ok(Self {
            timestamp,
            identity,
        })
    }
}

/// Failure to parse a textual iid/eid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed identifier")]
pub struct IdParseError;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_older_wraparound() {
        assert!(older(1, 2));
        assert!(!older(2, 1));
        assert!(!older(5, 5));

        // wrap-around: 0xFFFF_FFFF is one second older than 0
        assert!(older(0xFFFF_FFFF, 0));
        assert!(!older(0, 0xFFFF_FFFF));
    }

    #[test]
    fn test_iid_roundtrip() {
        let id = Iid {
            timestamp: 0x12ab,
            nonce: 0xdeadbeef,
        };
        let text = id.to_string();
        assert_eq!(text, "deadbeef12ab");
        assert_eq!(text.parse::<Iid>().unwrap(), id);
    }

    #[test]
    fn test_iid_short_nonce_padded() {
        let id = Iid {
            timestamp: 1,
            nonce: 7,
        };
        assert_eq!(id.to_string(), "000000071");
        assert_eq!("000000071".parse::<Iid>().unwrap(), id);
    }

    #[test]
    fn test_eid_roundtrip() {
        let e = Eid {
            timestamp: 0x55,
            identity: Iid {
                timestamp: 0x44,
                nonce: 0x0badcafe,
            },
        };
        let text = e.to_string();
        assert_eq!(text, "0badcafe44-55");
        assert_eq!(text.parse::<Eid>().unwrap(), e);
    }

    #[test]
    fn test_eid_binary_roundtrip() {
        let e = Eid {
            timestamp: 0xA1B2C3D4,
            identity: Iid {
                timestamp: 0x01020304,
                nonce: 0x05060708,
            },
        };
        let b = e.to_bytes();
        assert_eq!(Eid::read_from(&b), e);
    }

    #[test]
    fn test_eid_ordering() {
        let a = Eid {
            timestamp: 10,
            identity: Iid {
                timestamp: 1,
                nonce: 2,
            },
        };
        let b = Eid {
            timestamp: 11,
            identity: Iid {
                timestamp: 0,
                nonce: 0,
            },
        };
        assert!(a < b);
    }

    #[test]
    fn test_announcement_eid() {
        let id = Iid {
            timestamp: 123,
            nonce: 456,
        };
        let e = Eid::announcement(id);
        assert_eq!(e.timestamp, id.timestamp);
        assert_eq!(e.identity, id);
    }
}
