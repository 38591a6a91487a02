//! Coordination requests
//!
//! Anything smaller than the smallest possible entry is a request: a u32
//! header packing a 24-bit timestamp mark with an 8-bit type, followed by
//! a type-specific payload. The mark keeps replayed requests from having
//! effect beyond a short window.

use crate::consensus;
use crate::entry;
use crate::net::address::Address;
use crate::types::Eid;
use std::net::IpAddr;

pub const HEADER_SIZE: usize = 4;

/// Anything this size or larger is an entry, not a request.
pub const MAX_SIZE: usize = entry::MIN_SIZE - 1;
pub const MAX_PAYLOAD: usize = MAX_SIZE - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// First packet after securing; carries the protocol magic so both
    /// sides know encryption actually works.
    Initial = 0x00,
    /// Peer announces the port it listens on.
    Listening = 0x02,
    /// Small random sample of peer addresses, heavily throttled.
    Peers = 0x10,
    /// Third-party peer advertisement.
    Ipv4Peer = 0x11,
    Ipv6Peer = 0x12,
    /// History digest of the identities table.
    Identities = 0x20,
    /// History digest of the channels table.
    Channels = 0x21,
    /// Subscribe to a channel/thread, digest attached.
    Subscribe = 0x30,
    Unsubscribe = 0x31,
    /// Disregard subscriptions, send all; used by propagating nodes.
    Everything = 0x32,
    /// Bulk fetch of a channel or thread since a threshold.
    Download = 0x33,
}

impl RequestType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Initial,
            0x02 => Self::Listening,
            0x10 => Self::Peers,
            0x11 => Self::Ipv4Peer,
            0x12 => Self::Ipv6Peer,
            0x20 => Self::Identities,
            0x21 => Self::Channels,
            0x30 => Self::Subscribe,
            0x31 => Self::Unsubscribe,
            0x32 => Self::Everything,
            0x33 => Self::Download,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initial => "init",
            Self::Listening => "listening",
            Self::Peers => "peers",
            Self::Ipv4Peer => "IPv4 peer",
            Self::Ipv6Peer => "IPv6 peer",
            Self::Identities => "identities",
            Self::Channels => "channels",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Everything => "everything",
            Self::Download => "download",
        }
    }
}

/// Assemble a request packet; the mark is the low 24 bits of 'now'.
pub fn build(now: u32, request: RequestType, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let header = (now & 0x00FF_FFFF) | ((request as u32) << 24);
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&header.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// 24-bit modular freshness check of the request mark.
fn mark_fresh(mark: u32, now: u32) -> bool {
    let now = now & 0x00FF_FFFF;
    let age = now.wrapping_sub(mark) & 0x00FF_FFFF;
    if age <= consensus::MAX_REQUEST_AGE_ALLOWED {
        return true;
    }
    let skew = mark.wrapping_sub(now) & 0x00FF_FFFF;
    skew <= consensus::MAX_REQUEST_SKEW_ALLOWED
}

/// Validate the frame and split it into type and payload.
pub fn parse(bytes: &[u8], now: u32) -> Option<(RequestType, &[u8])> {
    if bytes.len() < HEADER_SIZE || bytes.len() > MAX_SIZE {
        return None;
    }
    let header = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let request = RequestType::from_u8((header >> 24) as u8)?;
    if !mark_fresh(header & 0x00FF_FFFF, now) {
        return None;
    }
    Some((request, &bytes[HEADER_SIZE..]))
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Third-party peer advertisement; the core flag is honored only from
/// peers that are themselves at level core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewPeer {
    pub address: Address,
    pub flags: u16,
}

pub const NEWPEER_CORE: u16 = 0x0001;

impl NewPeer {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(20);
        bytes.extend_from_slice(&self.address.port.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        match self.address.ip {
            IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
        }
        bytes
    }

    pub fn request_type(&self) -> RequestType {
        match self.address.ip {
            IpAddr::V4(_) => RequestType::Ipv4Peer,
            IpAddr::V6(_) => RequestType::Ipv6Peer,
        }
    }

    pub fn parse(request: RequestType, payload: &[u8]) -> Option<Self> {
        let port = u16::from_le_bytes(payload.get(0..2)?.try_into().ok()?);
        let flags = u16::from_le_bytes(payload.get(2..4)?.try_into().ok()?);
        let ip = match request {
            RequestType::Ipv4Peer if payload.len() == 8 => {
                IpAddr::from(<[u8; 4]>::try_from(&payload[4..8]).ok()?)
            }
            RequestType::Ipv6Peer if payload.len() == 20 => {
                IpAddr::from(<[u8; 16]>::try_from(&payload[4..20]).ok()?)
            }
            _ => return None,
        };
        Some(Self {
            address: Address::new(ip, port),
            flags,
        })
    }
}

/// Bulk fetch: everything descending 'parent' created at or after
/// 'threshold'. A null parent requests the whole database, allowed only
/// between core nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Download {
    pub parent: Eid,
    pub threshold: u32,
}

impl Download {
    pub const SIZE: usize = Eid::SIZE + 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        self.parent.write_to(&mut bytes[0..12]);
        bytes[12..16].copy_from_slice(&self.threshold.to_le_bytes());
        bytes
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            parent: Eid::read_from(&payload[0..12]),
            threshold: u32::from_le_bytes(payload[12..16].try_into().ok()?),
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
    fn test_build_parse_roundtrip() {
        let now = 0x12_345_678;
        let bytes = build(now, RequestType::Peers, &[]);
        assert_eq!(bytes.len(), HEADER_SIZE);
        let (request, payload) = parse(&bytes, now).unwrap();
        assert_eq!(request, RequestType::Peers);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_stale_mark_refused() {
        let now = 1_000_000;
        let bytes = build(now, RequestType::Peers, &[]);

        assert!(parse(&bytes, now + consensus::MAX_REQUEST_AGE_ALLOWED).is_some());
        assert!(parse(&bytes, now + consensus::MAX_REQUEST_AGE_ALLOWED + 1).is_none());

        // sender's clock slightly ahead is tolerated
        let ahead = build(now + consensus::MAX_REQUEST_SKEW_ALLOWED, RequestType::Peers, &[]);
        assert!(parse(&ahead, now).is_some());
        let too_far = build(
            now + consensus::MAX_REQUEST_SKEW_ALLOWED + 1,
            RequestType::Peers,
            &[],
        );
        assert!(parse(&too_far, now).is_none());
    }

    #[test]
    fn test_entry_sized_frame_not_a_request() {
        let bytes = vec![0u8; entry::MIN_SIZE];
        assert!(parse(&bytes, 0).is_none());
    }

    #[test]
    fn test_unknown_type_refused() {
        let now = 500;
        let mut bytes = build(now, RequestType::Peers, &[]);
        bytes[3] = 0x7F;
        assert!(parse(&bytes, now).is_none());
    }

    #[test]
    fn test_newpeer_roundtrip() {
        for address in ["9.8.7.6:44303", "[2001:4860::1]:999"] {
            let peer = NewPeer {
                address: address.parse().unwrap(),
                flags: NEWPEER_CORE,
            };
            let bytes = peer.to_bytes();
            assert_eq!(NewPeer::parse(peer.request_type(), &bytes).unwrap(), peer);
        }
    }

    #[test]
    fn test_download_roundtrip() {
        let download = Download {
            parent: Eid {
                timestamp: 42,
                identity: Iid {
                    timestamp: 40,
                    nonce: 1,
                },
            },
            threshold: 33,
        };
        assert_eq!(Download::parse(&download.to_bytes()).unwrap(), download);
    }
}
