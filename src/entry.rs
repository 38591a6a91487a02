//! On-wire entry model
//!
//! An entry is the single artifact of the network: identity announcements,
//! channel announcements, threads, comments and votes all share one layout.
//!
//! ```text
//! id (12) ‖ parent (12) ‖ signature (64) ‖ content ‖ NUL + proof
//! ```
//!
//! Identity announcements carry the author's 32-byte Ed25519 public key as
//! the leading bytes of their content. The signature is Ed25519ph over
//! (parent entry bytes ‖ id ‖ parent ‖ content ‖ proof); for announcements
//! the parent bytes are empty.

use crate::consensus;
use crate::crypto::{self, Prehash, SigningKey, VerifyingKey};
use crate::proof::{self, Proof, Requirements};
use crate::types::{Eid, Iid, older};
use sha2::Digest;
use std::sync::atomic::AtomicBool;

/// Fixed header: id ‖ parent ‖ signature.
pub const HEADER_SIZE: usize = 2 * Eid::SIZE + crypto::SIGNATURE_SIZE;

/// Maximum content following the header, bounded by the protocol frame.
pub const MAX_CONTENT_SIZE: usize = crate::net::protocol::MAX_PAYLOAD - HEADER_SIZE;

/// Anything smaller than header plus minimal proof is a request, not an entry.
pub const MIN_SIZE: usize = HEADER_SIZE + proof::MIN_SIZE;

/// Largest possible complete entry.
pub const MAX_SIZE: usize = HEADER_SIZE + MAX_CONTENT_SIZE;

/// Bytes an identity announcement header adds over a plain entry.
pub const IDENTITY_OVERHEAD: usize = crypto::PUBLIC_KEY_SIZE;

// =============================================================================
// CLASSIFICATION
// =============================================================================

/// Some entries announce new channel or identity creation. An identity is
/// also a channel, the target for personal messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    None,
    NewChannel,
    NewIdentity,
}

/// Classification is derived purely from the id/parent relationship.
pub fn announcement(id: &Eid, parent: &Eid) -> Announcement {
    if id == parent {
        if id.timestamp == id.identity.timestamp {
            Announcement::NewIdentity
        } else {
            Announcement::NewChannel
        }
    } else {
        Announcement::None
    }
}

/// Proof requirements according to entry kind.
pub fn default_requirements(id: &Eid, parent: &Eid) -> Requirements {
    if announcement(id, parent) != Announcement::None {
        Requirements {
            complexity: consensus::MIN_ANNOUNCEMENT_POW_COMPLEXITY,
            time: consensus::MIN_ANNOUNCEMENT_POW_TIME,
        }
    } else {
        Requirements {
            complexity: consensus::MIN_ENTRY_POW_COMPLEXITY,
            time: consensus::MIN_ENTRY_POW_TIME,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Structural validation failures. The numeric code is part of the stable
/// log contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("entry older than its parent")]
    OlderThanParent,
    #[error("entry older than its identity")]
    OlderThanIdentity,
    #[error("parent older than parent identity")]
    ParentOlderThanIdentity,
    #[error("entry timestamp too old")]
    TooOld,
    #[error("entry timestamp too far in the future")]
    Future,
    #[error("identity announcement too small")]
    IdentityTooSmall,
    #[error("identity name too long")]
    IdentityNameTooLong,
    #[error("channel name too long")]
    ChannelNameTooLong,
    #[error("entry content empty")]
    EmptyContent,
    #[error("proof of work missing or malformed")]
    NoProof,
    #[error("entry frame truncated")]
    Truncated,
}

impl EntryError {
    pub fn code(&self) -> u32 {
        match self {
            Self::OlderThanParent => 0x10,
            Self::OlderThanIdentity => 0x11,
            Self::ParentOlderThanIdentity => 0x12,
            Self::TooOld => 0x13,
            Self::Future => 0x14,
            Self::IdentityTooSmall => 0x18,
            Self::ChannelNameTooLong => 0x1D,
            Self::EmptyContent => 0x1A,
            Self::NoProof => 0x1B,
            Self::IdentityNameTooLong => 0x1C,
            Self::Truncated => 0x1F,
        }
    }
}

// =============================================================================
// FIELD ACCESS
// =============================================================================

#[inline]
pub fn id(bytes: &[u8]) -> Eid {
    Eid::read_from(&bytes[0..12])
}

#[inline]
pub fn parent(bytes: &[u8]) -> Eid {
    Eid::read_from(&bytes[12..24])
}

#[inline]
pub fn signature(bytes: &[u8]) -> &[u8] {
    &bytes[24..88]
}

/// Content between the header and the proof; call only on validated frames.
pub fn content(bytes: &[u8]) -> &[u8] {
    match locate_proof(bytes) {
        Some((offset, _)) => &bytes[HEADER_SIZE..offset],
        None => &bytes[HEADER_SIZE..],
    }
}

/// The announced public key of an identity announcement entry.
pub fn announced_public_key(bytes: &[u8]) -> Option<[u8; 32]> {
    let c = content(bytes);
    if c.len() < IDENTITY_OVERHEAD {
        return None;
    }
    c[0..32].try_into().ok()
}

/// Find the proof-of-work at the end of the entry. Returns (offset, size).
///
/// The proof follows content after (and including) a NUL byte; scanning
/// candidate sizes from the smallest, the header's encoded length must
/// match the candidate size exactly.
pub fn locate_proof(bytes: &[u8]) -> Option<(usize, usize)> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let available = bytes.len() - HEADER_SIZE;

    let mut length = proof::MIN_LENGTH;
    while length <= proof::MAX_LENGTH {
        let n = proof::size(length);
        if n > available {
            break;
        }
        let offset = bytes.len() - n;
        if Proof::validate(&bytes[offset..]) {
            return Some((offset, n));
        }
        length += 2;
    }
    None
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Basic validation of a received frame; 'bytes' must be the exact frame.
/// Signature and proof verification require database context, see
/// [`verify`] and `Db::assess`.
pub fn validate(bytes: &[u8], now: u32) -> Result<(), EntryError> {
    if bytes.len() < HEADER_SIZE {
        return Err(EntryError::Truncated);
    }
    let id = id(bytes);
    let parent = parent(bytes);

    if older(id.timestamp, parent.timestamp) {
        return Err(EntryError::OlderThanParent);
    }
    if older(id.timestamp, id.identity.timestamp) {
        return Err(EntryError::OlderThanIdentity);
    }
    if older(parent.timestamp, parent.identity.timestamp) {
        return Err(EntryError::ParentOlderThanIdentity);
    }
    if older(id.timestamp, now.wrapping_sub(consensus::MAX_ENTRY_AGE_STORED)) {
        return Err(EntryError::TooOld);
    }
    if older(
        now.wrapping_add(consensus::MAX_ENTRY_SKEW_ALLOWED),
        id.timestamp,
    ) {
        return Err(EntryError::Future);
    }

    if bytes.len() < MIN_SIZE {
        return Err(EntryError::NoProof);
    }
    let Some((_, proof_size)) = locate_proof(bytes) else {
        return Err(EntryError::NoProof);
    };

    let content_size = bytes.len() - HEADER_SIZE - proof_size;
    match announcement(&id, &parent) {
        Announcement::NewIdentity => {
            if content_size < IDENTITY_OVERHEAD {
                return Err(EntryError::IdentityTooSmall);
            }
            if content_size - IDENTITY_OVERHEAD > consensus::MAX_IDENTITY_NAME_SIZE {
                return Err(EntryError::IdentityNameTooLong);
            }
            Ok(())
        }
        Announcement::NewChannel => {
            if content_size > consensus::MAX_CHANNEL_NAME_SIZE {
                return Err(EntryError::ChannelNameTooLong);
            }
            Ok(())
        }
        Announcement::None => {
            if content_size == 0 {
                return Err(EntryError::EmptyContent);
            }
            Ok(())
        }
    }
}

// =============================================================================
// SIGNATURE DOMAIN
// =============================================================================

/// Accumulates the signature/proof domain:
/// parent entry bytes ‖ id ‖ parent ‖ content.
fn prehash(bytes: &[u8], content_end: usize, parent_bytes: &[u8]) -> Prehash {
    let mut state = Prehash::new();
    state.update(parent_bytes);
    state.update(&bytes[0..24]);
    state.update(&bytes[HEADER_SIZE..content_end]);
    state
}

/// Verify proof-of-work and signature of a validated entry.
///
/// 'parent_bytes' is the complete parent entry (empty for announcements),
/// 'public_key' the author identity's key.
pub fn verify(bytes: &[u8], parent_bytes: &[u8], public_key: &VerifyingKey) -> bool {
    verify_with(bytes, parent_bytes, public_key, true)
}

pub(crate) fn verify_with(
    bytes: &[u8],
    parent_bytes: &[u8],
    public_key: &VerifyingKey,
    check_proof: bool,
) -> bool {
    let Some((proof_offset, _)) = locate_proof(bytes) else {
        return false;
    };

    let mut state = prehash(bytes, proof_offset, parent_bytes);
    if check_proof {
        let Some(proof) = Proof::parse(&bytes[proof_offset..]) else {
            return false;
        };
        if proof.complexity < minimum_complexity(bytes)
            || !proof.verify(&crypto::finalize(state.clone()))
        {
            return false;
        }
    }

    state.update(&bytes[proof_offset..]);
    let Ok(signature) = crypto::Signature::from_slice(signature(bytes)) else {
        return false;
    };
    crypto::verify_prehashed(public_key, state, &signature)
}

/// Consensus minimum proof complexity for this entry's kind.
fn minimum_complexity(bytes: &[u8]) -> u32 {
    if announcement(&id(bytes), &parent(bytes)) != Announcement::None {
        consensus::MIN_ANNOUNCEMENT_POW_COMPLEXITY
    } else {
        consensus::MIN_ENTRY_POW_COMPLEXITY
    }
}

/// Prove and sign a new entry, returning the complete wire frame.
///
/// 'content' excludes the proof; for identity announcements it must begin
/// with the announced public key. Returns None when no proof was found for
/// this hash (normal, retry with a fresh timestamp) or on cancellation.
pub fn sign(
    id: &Eid,
    parent: &Eid,
    content: &[u8],
    parent_bytes: &[u8],
    key: &SigningKey,
    requirements: Requirements,
    cancel: Option<&AtomicBool>,
) -> Option<Vec<u8>> {
    if content.len() > MAX_CONTENT_SIZE {
        return None;
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + content.len() + proof::MAX_SIZE);
    bytes.resize(HEADER_SIZE, 0);
    id.write_to(&mut bytes[0..12]);
    parent.write_to(&mut bytes[12..24]);
    bytes.extend_from_slice(content);

    let mut state = prehash(&bytes, bytes.len(), parent_bytes);

    let maximum = MAX_CONTENT_SIZE - content.len();
    let proof_bytes = proof::generate(
        &crypto::finalize(state.clone()),
        maximum,
        requirements,
        cancel,
    )?;

    state.update(&proof_bytes);
    let signature = crypto::sign_prehashed(key, state).ok()?;
    bytes[24..88].copy_from_slice(&signature.to_bytes());
    bytes.extend_from_slice(&proof_bytes);
    Some(bytes)
}

/// Assemble and sign a frame around an already-computed proof. This is the
/// second stage of [`sign`], exposed for pipelines where proving and
/// signing happen separately.
pub fn sign_with_proof(
    id: &Eid,
    parent: &Eid,
    content: &[u8],
    parent_bytes: &[u8],
    proof_bytes: &[u8],
    key: &SigningKey,
) -> Option<Vec<u8>> {
    if content.len() + proof_bytes.len() > MAX_CONTENT_SIZE || !Proof::validate(proof_bytes) {
        return None;
    }

    let mut bytes = vec![0u8; HEADER_SIZE];
    id.write_to(&mut bytes[0..12]);
    parent.write_to(&mut bytes[12..24]);
    bytes.extend_from_slice(content);

    let mut state = prehash(&bytes, bytes.len(), parent_bytes);
    state.update(proof_bytes);

    let signature = crypto::sign_prehashed(key, state).ok()?;
    bytes[24..88].copy_from_slice(&signature.to_bytes());
    bytes.extend_from_slice(proof_bytes);
    Some(bytes)
}

// =============================================================================
// IDENTITY / CHANNEL CREATION
// =============================================================================

/// Create a new identity: fresh keypair and the derived iid whose nonce is
/// the keyed hash of creation time and public key, preventing vanity
/// collisions.
pub fn new_identity(magic: &[u8; 8], timestamp: u32) -> (SigningKey, Iid) {
    let mut secret = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut secret);
    let key = SigningKey::from_bytes(&secret);
    crypto::memzero(&mut secret);

    let nonce = crypto::keyed_nonce(timestamp, magic, key.verifying_key().as_bytes());
    (
        key,
        Iid {
            timestamp,
            nonce,
        },
    )
}

/// Check an identity announcement's nonce against its announced key.
pub fn verify_identity_nonce(bytes: &[u8], magic: &[u8; 8]) -> bool {
    let id = id(bytes);
    match announced_public_key(bytes) {
        Some(pk) => id.identity.nonce == crypto::keyed_nonce(id.identity.timestamp, magic, &pk),
        None => false,
    }
}

/// Derive a new channel announcement id for 'author' at 'timestamp'.
/// Channel announcements have `id == parent`.
pub fn new_channel(author: Iid, timestamp: u32) -> Eid {
    Eid {
        timestamp,
        identity: author,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    const MAGIC: &[u8; 8] = b"RADDI/1\0";

    fn fabricate(id: Eid, parent: Eid, content: &[u8], proof_cycle: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        id.write_to(&mut bytes[0..12]);
        parent.write_to(&mut bytes[12..24]);
        bytes.extend_from_slice(content);
        let proof = Proof {
            complexity: 26,
            cycle: (0..proof_cycle as u64).collect(),
        };
        bytes.extend_from_slice(&proof.to_bytes().unwrap());
        bytes
    }

    fn ordinary_ids(now: u32) -> (Eid, Eid) {
        let author = Iid {
            timestamp: now - 100,
            nonce: 0x1234,
        };
        let id = Eid {
            timestamp: now,
            identity: author,
        };
        let parent = Eid {
            timestamp: now - 50,
            identity: Iid {
                timestamp: now - 90,
                nonce: 0x5678,
            },
        };
        (id, parent)
    }

    #[test]
    fn test_announcement_classification() {
        let identity = Iid {
            timestamp: 100,
            nonce: 1,
        };
        let ann = Eid::announcement(identity);
        assert_eq!(announcement(&ann, &ann), Announcement::NewIdentity);

        let channel = Eid {
            timestamp: 200,
            identity,
        };
        assert_eq!(announcement(&channel, &channel), Announcement::NewChannel);

        let other = Eid {
            timestamp: 300,
            identity,
        };
        assert_eq!(announcement(&other, &channel), Announcement::None);
    }

    #[test]
    fn test_validate_ordinary() {
        let t = now();
        let (id, parent) = ordinary_ids(t);
        let bytes = fabricate(id, parent, b"hello", 12);
        assert_eq!(validate(&bytes, t), Ok(()));
    }

    #[test]
    fn test_validate_rejects_time_travel() {
        let t = now();
        let (id, parent) = ordinary_ids(t);

        let mut child_of_future = fabricate(id, parent, b"x", 12);
        // parent newer than entry
        let bad_parent = Eid {
            timestamp: t + 10,
            ..parent
        };
        bad_parent.write_to(&mut child_of_future[12..24]);
        assert_eq!(
            validate(&child_of_future, t),
            Err(EntryError::OlderThanParent)
        );
    }

    #[test]
    fn test_validate_skew_boundary() {
        let t = now();
        let (id, parent) = ordinary_ids(t);

        let at_limit = Eid {
            timestamp: t + consensus::MAX_ENTRY_SKEW_ALLOWED,
            ..id
        };
        let bytes = fabricate(at_limit, parent, b"x", 12);
        assert_eq!(validate(&bytes, t), Ok(()));

        let over_limit = Eid {
            timestamp: t + consensus::MAX_ENTRY_SKEW_ALLOWED + 1,
            ..id
        };
        let bytes = fabricate(over_limit, parent, b"x", 12);
        assert_eq!(validate(&bytes, t), Err(EntryError::Future));
    }

    #[test]
    fn test_validate_requires_content() {
        let t = now();
        let (id, parent) = ordinary_ids(t);
        let bytes = fabricate(id, parent, b"", 12);
        assert_eq!(validate(&bytes, t), Err(EntryError::EmptyContent));
    }

    #[test]
    fn test_validate_channel_name_bounds() {
        let t = now();
        let author = Iid {
            timestamp: t - 100,
            nonce: 0x9,
        };
        let channel = new_channel(author, t);

        let name = vec![b'c'; consensus::MAX_CHANNEL_NAME_SIZE];
        let bytes = fabricate(channel, channel, &name, 12);
        assert_eq!(validate(&bytes, t), Ok(()));

        let name = vec![b'c'; consensus::MAX_CHANNEL_NAME_SIZE + 1];
        let bytes = fabricate(channel, channel, &name, 12);
        assert_eq!(validate(&bytes, t), Err(EntryError::ChannelNameTooLong));
    }

    #[test]
    fn test_locate_proof() {
        let t = now();
        let (id, parent) = ordinary_ids(t);

        for length in [12u32, 42] {
            let bytes = fabricate(id, parent, b"content", length);
            let (offset, size) = locate_proof(&bytes).unwrap();
            assert_eq!(size, proof::size(length));
            assert_eq!(offset, bytes.len() - size);
            assert_eq!(content(&bytes), b"content");
        }
    }

    #[test]
    fn test_identity_nonce_roundtrip() {
        let t = now();
        let (key, iid) = new_identity(MAGIC, t);
        let ann = Eid::announcement(iid);

        let mut content = key.verifying_key().as_bytes().to_vec();
        content.extend_from_slice(b"alice");
        let bytes = fabricate(ann, ann, &content, 12);

        assert_eq!(validate(&bytes, t), Ok(()));
        assert!(verify_identity_nonce(&bytes, MAGIC));
        assert!(!verify_identity_nonce(&bytes, b"RADDI/2\0"));
    }

    /// Sign around a precomputed proof, verify the signature layer. Graph
    /// verification of the proof itself is covered in the proof module at
    /// tractable complexity.
    #[test]
    fn test_sign_with_proof_signature_roundtrip() {
        let t = now();
        let (key, iid) = new_identity(MAGIC, t);
        let ann = Eid::announcement(iid);

        let mut content = key.verifying_key().as_bytes().to_vec();
        content.extend_from_slice(b"bob");

        let proof_bytes = Proof {
            complexity: 27,
            cycle: (10..22u64).collect(),
        }
        .to_bytes()
        .unwrap();

        let bytes = sign_with_proof(&ann, &ann, &content, &[], &proof_bytes, &key).unwrap();
        assert_eq!(validate(&bytes, t), Ok(()));
        assert!(verify_with(&bytes, &[], &key.verifying_key(), false));

        // flipped content byte breaks the signature
        let mut tampered = bytes.clone();
        tampered[HEADER_SIZE] ^= 0x01;
        assert!(!verify_with(&tampered, &[], &key.verifying_key(), false));

        // flipped proof byte breaks the signature as well, the proof is
        // inside the signed domain
        let mut tampered = bytes.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(!verify_with(&tampered, &[], &key.verifying_key(), false));
    }

    /// An ordinary entry's signature domain includes the full parent frame.
    #[test]
    fn test_signature_domain_covers_parent() {
        let t = now();
        let (key, iid) = new_identity(MAGIC, t);

        let id = Eid {
            timestamp: t,
            identity: iid,
        };
        let parent = Eid {
            timestamp: t - 10,
            identity: iid,
        };
        let proof_bytes = Proof {
            complexity: 26,
            cycle: (0..12u64).collect(),
        }
        .to_bytes()
        .unwrap();

        let parent_frame = vec![0xAB; 200];
        let bytes =
            sign_with_proof(&id, &parent, b"reply", &parent_frame, &proof_bytes, &key).unwrap();

        assert!(verify_with(&bytes, &parent_frame, &key.verifying_key(), false));

        let mut other_parent = parent_frame.clone();
        other_parent[0] ^= 1;
        assert!(!verify_with(&bytes, &other_parent, &key.verifying_key(), false));
    }
}
