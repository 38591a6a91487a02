//! Wire protocol: handshake and AEAD framing
//!
//! The first packet each way is a fixed 160-byte head carrying the public
//! halves of two X25519 exchanges (one per direction), two random nonces,
//! XOR-obfuscated flag pairs, an obfuscated timestamp and a keyed
//! checksum. After both heads are exchanged every message is
//! `u16 length (LE) ‖ ciphertext+tag`, where lengths 0x0000 and 0xFFFF are
//! in-band keep-alive tokens rather than frames.

use crate::crypto;
use crate::net::address::Address;
use crate::types::microtimestamp;
use rand::RngCore;
use rand::rngs::OsRng;
use std::net::IpAddr;
use x25519_dalek::{PublicKey, StaticSecret};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

/// Distinguishes incompatible protocol versions; hashed into the link keys
/// so only compatible peers can ever talk.
pub const MAGIC: &[u8; 8] = b"RADDI/1\0";

/// Length prefix plus AEAD tag.
pub const FRAME_OVERHEAD: usize = 2 + 16;

/// Maximum data encoded inside one protocol frame. One less than the
/// arithmetic limit: that reserves the 0xFFFF length token for keep-alive.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - FRAME_OVERHEAD + 2 - 1;

/// Whole-frame limit, all inclusive.
pub const MAX_FRAME_SIZE: usize = FRAME_OVERHEAD + MAX_PAYLOAD;

/// Handshake head size on the wire.
pub const HEAD_SIZE: usize = 160;

pub const KEEPALIVE_QUERY: u16 = 0x0000;
pub const KEEPALIVE_RESPONSE: u16 = 0xFFFF;

/// Soft flag bits: AEAD schemes the peer is willing to use besides the
/// XChaCha20-Poly1305 baseline.
const SOFT_AES256GCM: u32 = 0x0000_0001;
const SOFT_AEGIS256: u32 = 0x0000_0002;

/// Hardware cipher policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherMode {
    /// Never advertised, never used.
    Disabled,
    /// Best mutually supported scheme, XChaCha20-Poly1305 fallback.
    #[default]
    Automatic,
    /// Either AES scheme required; peers without one are disconnected.
    Forced,
    /// AES-256-GCM required.
    ForceGcm,
    /// AEGIS-256 required.
    ForceAegis,
}

/// Reasons the handshake may refuse a peer; all fatal for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    #[error("head checksum mismatch, different software or magic")]
    Checksum,
    #[error("unknown hard flags set")]
    Flags,
    #[error("peer clock skew too large")]
    Time,
    #[error("forced cipher unavailable at peer")]
    Aes,
}

// =============================================================================
// HANDSHAKE HEAD
// =============================================================================

/// Parsed 160-byte handshake head.
///
/// Layout, little-endian throughout: inbound_key ‖ outbound_key ‖
/// inbound_nonce ‖ outbound_nonce (32 each) ‖ soft pair ‖ hard pair
/// (a, b = a ⊕ value) ‖ timestamp ‖ checksum.
#[derive(Debug, Clone)]
pub struct InitialHead {
    pub inbound_key: [u8; 32],
    pub outbound_key: [u8; 32],
    pub inbound_nonce: [u8; 32],
    pub outbound_nonce: [u8; 32],
    pub soft: (u32, u32),
    pub hard: (u32, u32),
    pub timestamp: u64,
    pub checksum: u64,
}

impl InitialHead {
    pub fn to_bytes(&self) -> [u8; HEAD_SIZE] {
        let mut bytes = [0u8; HEAD_SIZE];
        bytes[0..32].copy_from_slice(&self.inbound_key);
        bytes[32..64].copy_from_slice(&self.outbound_key);
        bytes[64..96].copy_from_slice(&self.inbound_nonce);
        bytes[96..128].copy_from_slice(&self.outbound_nonce);
        bytes[128..132].copy_from_slice(&self.soft.0.to_le_bytes());
        bytes[132..136].copy_from_slice(&self.soft.1.to_le_bytes());
        bytes[136..140].copy_from_slice(&self.hard.0.to_le_bytes());
        bytes[140..144].copy_from_slice(&self.hard.1.to_le_bytes());
        bytes[144..152].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[152..160].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8; HEAD_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            u32::from_le_bytes(bytes[range].try_into().unwrap())
        };
        Self {
            inbound_key: bytes[0..32].try_into().unwrap(),
            outbound_key: bytes[32..64].try_into().unwrap(),
            inbound_nonce: bytes[64..96].try_into().unwrap(),
            outbound_nonce: bytes[96..128].try_into().unwrap(),
            soft: (word(128..132), word(132..136)),
            hard: (word(136..140), word(140..144)),
            timestamp: u64::from_le_bytes(bytes[144..152].try_into().unwrap()),
            checksum: u64::from_le_bytes(bytes[152..160].try_into().unwrap()),
        }
    }

    pub fn soft_flags(&self) -> u32 {
        self.soft.0 ^ self.soft.1
    }

    pub fn hard_flags(&self) -> u32 {
        self.hard.0 ^ self.hard.1
    }
}

fn obfuscate(value: u32) -> (u32, u32) {
    let a = OsRng.next_u32();
    (a, a ^ value)
}

// =============================================================================
// PROPOSAL
// =============================================================================

/// Private half of a handshake in progress: D-H secrets and nonces for
/// both directions. Replaced by the negotiated [`CipherPair`] on accept.
pub struct Proposal {
    magic: [u8; 8],
    mode: CipherMode,
    inbound_secret: StaticSecret,
    outbound_secret: StaticSecret,
    inbound_nonce: [u8; 32],
    outbound_nonce: [u8; 32],
    public_inbound_key: [u8; 32],
}

impl Proposal {
    /// Randomize a proposal and generate the head to transmit.
    pub fn propose(magic: [u8; 8], mode: CipherMode) -> (Self, InitialHead) {
        let inbound_secret = StaticSecret::random_from_rng(OsRng);
        let outbound_secret = StaticSecret::random_from_rng(OsRng);

        let mut inbound_nonce = [0u8; 32];
        let mut outbound_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut inbound_nonce);
        OsRng.fill_bytes(&mut outbound_nonce);

        let soft = match mode {
            CipherMode::Disabled => 0,
            CipherMode::ForceGcm => SOFT_AES256GCM,
            CipherMode::ForceAegis => SOFT_AEGIS256,
            CipherMode::Automatic | CipherMode::Forced => SOFT_AES256GCM | SOFT_AEGIS256,
        };

        let public_inbound_key = PublicKey::from(&inbound_secret).to_bytes();
        let mut head = InitialHead {
            inbound_key: public_inbound_key,
            outbound_key: PublicKey::from(&outbound_secret).to_bytes(),
            inbound_nonce,
            outbound_nonce,
            soft: obfuscate(soft),
            hard: obfuscate(0),
            timestamp: microtimestamp()
                ^ u64::from_le_bytes(public_inbound_key[0..8].try_into().unwrap()),
            checksum: 0,
        };

        let bytes = head.to_bytes();
        head.checksum = crypto::checksum64(&public_inbound_key, &magic, &bytes[0..152]);

        (
            Self {
                magic,
                mode,
                inbound_secret,
                outbound_secret,
                inbound_nonce,
                outbound_nonce,
                public_inbound_key,
            },
            head,
        )
    }

    /// Detect our own head coming back at us through a loop: the random
    /// nonces would match exactly.
    pub fn reflects(&self, peer: &InitialHead) -> bool {
        self.inbound_nonce == peer.inbound_nonce && self.outbound_nonce == peer.outbound_nonce
    }

    /// Finish D-H and negotiate the cipher according to the peer's head.
    pub fn accept(self, peer: &InitialHead) -> Result<CipherPair, AcceptError> {
        // checksum is keyed by the head's own inbound key and the magic;
        // any flipped byte or different magic fails here
        let peer_bytes = peer.to_bytes();
        if peer.checksum != crypto::checksum64(&peer.inbound_key, &self.magic, &peer_bytes[0..152])
        {
            return Err(AcceptError::Checksum);
        }

        let peer_time =
            peer.timestamp ^ u64::from_le_bytes(peer.inbound_key[0..8].try_into().unwrap());
        let skew = peer_time.abs_diff(microtimestamp());
        if skew > 1_000_000 * crate::consensus::MAX_ENTRY_SKEW_ALLOWED as u64 {
            return Err(AcceptError::Time);
        }

        if peer.hard_flags() != 0 {
            return Err(AcceptError::Flags);
        }

        let kind = match self.mode {
            CipherMode::Disabled => CipherKind::XChaCha20Poly1305,
            mode => {
                let soft = peer.soft_flags();
                if soft & SOFT_AEGIS256 != 0 && mode != CipherMode::ForceGcm {
                    CipherKind::Aegis256
                } else if soft & SOFT_AES256GCM != 0 && mode != CipherMode::ForceAegis {
                    CipherKind::Aes256Gcm
                } else if matches!(
                    mode,
                    CipherMode::Forced | CipherMode::ForceGcm | CipherMode::ForceAegis
                ) {
                    return Err(AcceptError::Aes);
                } else {
                    CipherKind::XChaCha20Poly1305
                }
            }
        };

        // per-direction session keys from the two D-H results, session
        // nonces as sum of ours and the peer's opposite-direction nonce
        let receive_shared = self
            .inbound_secret
            .diffie_hellman(&PublicKey::from(peer.outbound_key));
        let transmit_shared = self
            .outbound_secret
            .diffie_hellman(&PublicKey::from(peer.inbound_key));

        let mut inbound_nonce = self.inbound_nonce;
        let mut outbound_nonce = self.outbound_nonce;
        crypto::nonce_add(&mut inbound_nonce, &peer.outbound_nonce);
        crypto::nonce_add(&mut outbound_nonce, &peer.inbound_nonce);

        Ok(CipherPair {
            inbound: CipherState::new(
                kind,
                crypto::session_key(receive_shared.as_bytes(), &self.magic),
                &inbound_nonce,
            ),
            outbound: CipherState::new(
                kind,
                crypto::session_key(transmit_shared.as_bytes(), &self.magic),
                &outbound_nonce,
            ),
        })
    }

    pub fn public_inbound_key(&self) -> &[u8; 32] {
        &self.public_inbound_key
    }
}

// =============================================================================
// CIPHERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    XChaCha20Poly1305,
    Aes256Gcm,
    Aegis256,
}

impl CipherKind {
    /// Nonce size the scheme actually consumes from the 32-byte base.
    fn nonce_size(&self) -> usize {
        match self {
            CipherKind::XChaCha20Poly1305 => 24,
            CipherKind::Aes256Gcm => 12,
            CipherKind::Aegis256 => 32,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::XChaCha20Poly1305 => "XChaCha20-Poly1305",
            CipherKind::Aes256Gcm => "AES256-GCM",
            CipherKind::Aegis256 => "AEGIS-256",
        }
    }
}

/// One direction of a secured link: key plus a monotonically incremented
/// nonce. Encode and decode must be called strictly in frame order.
pub struct CipherState {
    kind: CipherKind,
    key: [u8; 32],
    nonce: Vec<u8>,
}

impl Drop for CipherState {
    fn drop(&mut self) {
        crypto::memzero(&mut self.key);
        crypto::memzero(&mut self.nonce);
    }
}

impl CipherState {
    fn new(kind: CipherKind, key: [u8; 32], nonce_base: &[u8; 32]) -> Self {
        Self {
            kind,
            key,
            nonce: nonce_base[0..kind.nonce_size()].to_vec(),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt and frame a payload; the 2-byte length prefix is the
    /// additional authenticated data.
    pub fn encode(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD {
            return None;
        }
        let length = (payload.len() + 16) as u16;
        let prefix = length.to_le_bytes();
        crypto::nonce_increment(&mut self.nonce);

        let sealed = match self.kind {
            CipherKind::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new((&self.key).into());
                cipher
                    .encrypt(
                        XNonce::from_slice(&self.nonce),
                        Payload {
                            msg: payload,
                            aad: &prefix,
                        },
                    )
                    .ok()?
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new((&self.key).into());
                cipher
                    .encrypt(
                        Nonce::from_slice(&self.nonce),
                        Payload {
                            msg: payload,
                            aad: &prefix,
                        },
                    )
                    .ok()?
            }
            CipherKind::Aegis256 => {
                let nonce: [u8; 32] = self.nonce.as_slice().try_into().ok()?;
                let (mut ciphertext, tag) =
                    aegis::aegis256::Aegis256::<16>::new(&self.key, &nonce)
                        .encrypt(payload, &prefix);
                ciphertext.extend_from_slice(&tag);
                ciphertext
            }
        };

        let mut frame = Vec::with_capacity(2 + sealed.len());
        frame.extend_from_slice(&prefix);
        frame.extend_from_slice(&sealed);
        Some(frame)
    }

    /// Decrypt a complete frame (length prefix included).
    pub fn decode(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < FRAME_OVERHEAD || frame.len() > MAX_FRAME_SIZE {
            return None;
        }
        let prefix = &frame[0..2];
        let sealed = &frame[2..];
        crypto::nonce_increment(&mut self.nonce);

        match self.kind {
            CipherKind::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new((&self.key).into());
                cipher
                    .decrypt(
                        XNonce::from_slice(&self.nonce),
                        Payload {
                            msg: sealed,
                            aad: prefix,
                        },
                    )
                    .ok()
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new((&self.key).into());
                cipher
                    .decrypt(
                        Nonce::from_slice(&self.nonce),
                        Payload {
                            msg: sealed,
                            aad: prefix,
                        },
                    )
                    .ok()
            }
            CipherKind::Aegis256 => {
                let nonce: [u8; 32] = self.nonce.as_slice().try_into().ok()?;
                let split = sealed.len().checked_sub(16)?;
                let tag: [u8; 16] = sealed[split..].try_into().ok()?;
                aegis::aegis256::Aegis256::<16>::new(&self.key, &nonce)
                    .decrypt(&sealed[..split], &tag, prefix)
                    .ok()
            }
        }
    }
}

/// Both directions of a freshly secured link.
pub struct CipherPair {
    pub inbound: CipherState,
    pub outbound: CipherState,
}

// =============================================================================
// SOCKS5 PROLOGUE
// =============================================================================

/// Greeting: version 5, one method, no authentication.
pub fn socks5_greeting() -> [u8; 3] {
    [0x05, 0x01, 0x00]
}

/// CONNECT request for the target address.
pub fn socks5_connect(target: &Address) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00];
    match target.ip {
        IpAddr::V4(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    request
}

/// Bytes of reply remaining after the 4-byte reply header, by ATYP.
pub fn socks5_reply_remainder(atyp: u8) -> Option<usize> {
    match atyp {
        0x01 => Some(4 + 2),
        0x04 => Some(16 + 2),
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(
        a_mode: CipherMode,
        b_mode: CipherMode,
    ) -> (
        Result<CipherPair, AcceptError>,
        Result<CipherPair, AcceptError>,
    ) {
        let (a, a_head) = Proposal::propose(*MAGIC, a_mode);
        let (b, b_head) = Proposal::propose(*MAGIC, b_mode);
        (a.accept(&b_head), b.accept(&a_head))
    }

    #[test]
    fn test_head_roundtrip() {
        let (_, head) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        let parsed = InitialHead::parse(&head.to_bytes());
        assert_eq!(parsed.to_bytes(), head.to_bytes());
        assert_eq!(parsed.hard_flags(), 0);
    }

    #[test]
    fn test_handshake_negotiates_aegis() {
        let (a, b) = handshake(CipherMode::Automatic, CipherMode::ForceAegis);
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.outbound.kind(), CipherKind::Aegis256);
        assert_eq!(b.inbound.kind(), CipherKind::Aegis256);
    }

    #[test]
    fn test_handshake_fallback_software_cipher() {
        let (a, b) = handshake(CipherMode::Disabled, CipherMode::Automatic);
        // A advertises nothing, so B falls back; A disabled AES locally
        assert_eq!(a.unwrap().outbound.kind(), CipherKind::XChaCha20Poly1305);
        assert_eq!(b.unwrap().outbound.kind(), CipherKind::XChaCha20Poly1305);
    }

    #[test]
    fn test_handshake_forced_unavailable() {
        let (_, b) = handshake(CipherMode::Disabled, CipherMode::Forced);
        assert_eq!(b.unwrap_err(), AcceptError::Aes);
    }

    #[test]
    fn test_frames_decode_across_the_link() {
        for mode in [
            CipherMode::Disabled,
            CipherMode::ForceGcm,
            CipherMode::ForceAegis,
        ] {
            let (a, b) = handshake(mode, mode);
            let mut a = a.unwrap();
            let mut b = b.unwrap();

            for message in [&b"first frame"[..], &b"second"[..], &[0u8; 1000][..]] {
                let frame = a.outbound.encode(message).unwrap();
                assert_eq!(b.inbound.decode(&frame).unwrap(), message);

                let frame = b.outbound.encode(message).unwrap();
                assert_eq!(a.inbound.decode(&frame).unwrap(), message);
            }
        }
    }

    #[test]
    fn test_tampered_frame_refused() {
        let (a, b) = handshake(CipherMode::Automatic, CipherMode::Automatic);
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        let mut frame = a.outbound.encode(b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        assert!(b.inbound.decode(&frame).is_none());
    }

    #[test]
    fn test_nonce_advance_detects_reorder() {
        let (a, b) = handshake(CipherMode::Automatic, CipherMode::Automatic);
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        let first = a.outbound.encode(b"one").unwrap();
        let second = a.outbound.encode(b"two").unwrap();

        // decoding out of order must fail, nonces are strictly sequential
        assert!(b.inbound.decode(&second).is_none());
        let _ = b.inbound.decode(&first);
    }

    #[test]
    fn test_flipped_head_byte_fails_checksum() {
        let (a, _) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        let (_, b_head) = Proposal::propose(*MAGIC, CipherMode::Automatic);

        let mut bytes = b_head.to_bytes();
        bytes[40] ^= 0x01;
        let tampered = InitialHead::parse(&bytes);
        assert_eq!(a.accept(&tampered).unwrap_err(), AcceptError::Checksum);
    }

    #[test]
    fn test_incompatible_magic_fails_checksum() {
        let (a, _) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        let (_, b_head) = Proposal::propose(*b"RADDI/2\0", CipherMode::Automatic);
        assert_eq!(a.accept(&b_head).unwrap_err(), AcceptError::Checksum);
    }

    #[test]
    fn test_unknown_hard_flag_disconnects() {
        let (a, _) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        let (_, mut b_head) = Proposal::propose(*MAGIC, CipherMode::Automatic);

        b_head.hard.1 ^= 0x8000_0000;
        let bytes = b_head.to_bytes();
        b_head.checksum = crypto::checksum64(&b_head.inbound_key, MAGIC, &bytes[0..152]);
        assert_eq!(a.accept(&b_head).unwrap_err(), AcceptError::Flags);
    }

    #[test]
    fn test_reflection_detection() {
        let (a, a_head) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        let (_, b_head) = Proposal::propose(*MAGIC, CipherMode::Automatic);
        assert!(a.reflects(&a_head));
        assert!(!a.reflects(&b_head));
    }

    #[test]
    fn test_socks5_prologue_shape() {
        let request = socks5_connect(&"1.2.3.4:44303".parse().unwrap());
        assert_eq!(&request[0..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&request[4..8], &[1, 2, 3, 4]);
        assert_eq!(&request[8..10], &44303u16.to_be_bytes());

        assert_eq!(socks5_reply_remainder(0x01), Some(6));
        assert_eq!(socks5_reply_remainder(0x04), Some(18));
        assert_eq!(socks5_reply_remainder(0x03), None);
    }
}
