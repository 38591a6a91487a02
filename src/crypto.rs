//! Thin typed wrappers over the cryptographic primitives
//!
//! Consensus operations are Ed25519ph (prehashed, SHA-512) signatures.
//! Link encryption key material is derived with keyed BLAKE2b. Short keyed
//! hashes (identity nonces, handshake checksums) are SipHash-2-4.

use blake2::Blake2bMac;
use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use sha2::{Digest, Sha512};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SECRET_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// SHA-512 running state used as the signature/proof domain accumulator.
pub type Prehash = Sha512;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signing failed")]
    Signing,
    #[error("malformed public key")]
    PublicKey,
}

/// Ed25519ph signature over an accumulated SHA-512 state.
pub fn sign_prehashed(key: &SigningKey, prehash: Prehash) -> Result<Signature, CryptoError> {
    key.sign_prehashed(prehash, None)
        .map_err(|_| CryptoError::Signing)
}

/// Ed25519ph verification over an accumulated SHA-512 state.
pub fn verify_prehashed(key: &VerifyingKey, prehash: Prehash, signature: &Signature) -> bool {
    key.verify_prehashed(prehash, None, signature).is_ok()
}

pub fn verifying_key(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::PublicKey)
}

/// Finalize a SHA-512 state into the 64-byte digest.
pub fn finalize(prehash: Prehash) -> [u8; 64] {
    prehash.finalize().into()
}

// =============================================================================
// SHORT KEYED HASHES
// =============================================================================

/// Identity nonce: keyed hash of timestamp ‖ protocol magic, keyed by the
/// identity's public key. Folded to 32 bits.
pub fn keyed_nonce(timestamp: u32, magic: &[u8; 8], public_key: &[u8; PUBLIC_KEY_SIZE]) -> u32 {
    let mut key = [0u8; 16];
    key.copy_from_slice(&public_key[0..16]);

    let mut hasher = SipHasher24::new_with_key(&key);
    hasher.write(&timestamp.to_le_bytes());
    hasher.write(magic);
    hasher.write(&public_key[16..32]);

    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

/// Handshake head checksum: SipHash-2-4 seeded from the proposer's public
/// inbound key and the protocol magic.
pub fn checksum64(seed: &[u8; 32], magic: &[u8; 8], data: &[u8]) -> u64 {
    let mut key = [0u8; 16];
    for i in 0..16 {
        key[i] = seed[i] ^ seed[i + 16] ^ magic[i % 8];
    }

    let mut hasher = SipHasher24::new_with_key(&key);
    hasher.write(data);
    hasher.finish()
}

/// Session key derivation: keyed BLAKE2b-256 of the X25519 shared secret,
/// keyed by the protocol magic. Incompatible magic yields incompatible keys.
pub fn session_key(shared: &[u8; 32], magic: &[u8; 8]) -> [u8; 32] {
    let mut mac = Blake2bMac::<U32>::new_from_slice(magic)
        .expect("8-byte key is always valid for BLAKE2b");
    Update::update(&mut mac, shared);
    mac.finalize_fixed().into()
}

// =============================================================================
// NONCE ARITHMETIC
// =============================================================================

/// Little-endian multi-byte add of 'addend' into 'nonce', wrapping.
pub fn nonce_add(nonce: &mut [u8], addend: &[u8]) {
    let mut carry = 0u16;
    for i in 0..nonce.len() {
        let sum = nonce[i] as u16 + *addend.get(i).unwrap_or(&0) as u16 + carry;
        nonce[i] = sum as u8;
        carry = sum >> 8;
    }
}

/// Little-endian increment of 'nonce' by one, wrapping.
pub fn nonce_increment(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        let (sum, overflow) = byte.overflowing_add(1);
        *byte = sum;
        if !overflow {
            break;
        }
    }
}

/// Best-effort wipe of secret material.
pub fn memzero(data: &mut [u8]) {
    for byte in data.iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_prehashed() {
        let key = SigningKey::from_bytes(&[7u8; 32]);

        let mut ph = Prehash::new();
        ph.update(b"hello raddi");
        let signature = sign_prehashed(&key, ph).unwrap();

        let mut ph = Prehash::new();
        ph.update(b"hello raddi");
        assert!(verify_prehashed(&key.verifying_key(), ph, &signature));

        let mut ph = Prehash::new();
        ph.update(b"hello raddi!");
        assert!(!verify_prehashed(&key.verifying_key(), ph, &signature));
    }

    #[test]
    fn test_keyed_nonce_depends_on_all_inputs() {
        let magic = *b"RADDI/1\0";
        let pk = [3u8; 32];

        let n = keyed_nonce(1000, &magic, &pk);
        assert_ne!(n, keyed_nonce(1001, &magic, &pk));
        assert_ne!(n, keyed_nonce(1000, b"RADDI/2\0", &pk));

        let mut pk2 = pk;
        pk2[31] ^= 1;
        assert_ne!(n, keyed_nonce(1000, &magic, &pk2));
    }

    #[test]
    fn test_nonce_increment_carries() {
        let mut nonce = [0xFF, 0xFF, 0x00];
        nonce_increment(&mut nonce);
        assert_eq!(nonce, [0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_nonce_add_carries() {
        let mut nonce = [0xFF, 0x00];
        nonce_add(&mut nonce, &[0x02, 0x00]);
        assert_eq!(nonce, [0x01, 0x01]);
    }

    #[test]
    fn test_nonce_add_commutes_with_swapped_sides() {
        // both peers must derive the same session nonce
        let a = [0x11u8; 24];
        let b = [0xEEu8; 24];

        let mut ab = a;
        nonce_add(&mut ab, &b);
        let mut ba = b;
        nonce_add(&mut ba, &a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_session_key_differs_by_magic() {
        let shared = [9u8; 32];
        assert_ne!(
            session_key(&shared, b"RADDI/1\0"),
            session_key(&shared, b"RADDI/2\0")
        );
    }
}
