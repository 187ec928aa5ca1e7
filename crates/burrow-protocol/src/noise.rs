//! # Noise Symmetric State
//!
//! The evolving symmetric state of the Noise_IKpsk2 handshake.
//!
//! ## Pattern
//!
//! ```text
//! IKpsk2:
//!   <- s
//!   ...
//!   -> e, es, s, ss
//!   <- e, ee, se, psk
//! ```
//!
//! Where:
//! - `e` = ephemeral key
//! - `s` = static key
//! - `es` = DH(initiator_ephemeral, responder_static)
//! - `ss` = DH(initiator_static, responder_static)
//! - `ee` = DH(initiator_ephemeral, responder_ephemeral)
//! - `se` = DH(responder_ephemeral, initiator_static)
//! - `psk` = optional preshared key, all zeros when unset
//!
//! ## Security Properties
//!
//! - Mutual authentication
//! - Perfect Forward Secrecy
//! - Identity hiding for the initiator
//! - Initiation-replay resistance (TAI64N timestamps, checked by the caller)

use std::fmt;
use zeroize::Zeroizing;

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Construction string mixed into the initial hash
pub const NOISE_CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Protocol identifier for additional binding
pub const NOISE_IDENTIFIER: &[u8] = b"burrow v1 layer-3 tunnel";

/// Hash output size (BLAKE2s = 32 bytes)
pub const HASH_SIZE: usize = 32;

/// Key size for symmetric operations
pub const KEY_SIZE: usize = 32;

// ═══════════════════════════════════════════════════════════════════════════
// SYMMETRIC STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Symmetric state for the handshake (CipherState + SymmetricState combined)
#[derive(Clone)]
pub struct SymmetricState {
    /// Chaining key (ck), evolves with each MixKey operation
    chaining_key: Zeroizing<[u8; HASH_SIZE]>,
    /// Handshake hash (h), binds all handshake data
    hash: [u8; HASH_SIZE],
    /// Current encryption key (k), derived from the chaining key
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    /// Nonce counter for handshake encryption (n)
    nonce: u64,
}

impl SymmetricState {
    /// Initialize from a protocol name.
    ///
    /// Names of 32 bytes or fewer seed the hash directly, longer names are
    /// hashed first.
    pub fn new(protocol_name: &[u8]) -> Self {
        let mut hash = [0u8; HASH_SIZE];

        if protocol_name.len() <= HASH_SIZE {
            hash[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            hash = blake2s_hash(protocol_name);
        }

        Self {
            chaining_key: Zeroizing::new(hash),
            hash,
            key: None,
            nonce: 0,
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s_hash_two(&self.hash, data);
    }

    /// (ck, k) = HKDF(ck, dh_output)
    pub fn mix_key(&mut self, dh_output: &[u8]) {
        let (new_ck, new_key) = hkdf_blake2s(&*self.chaining_key, dh_output);
        self.chaining_key = new_ck;
        self.key = Some(new_key);
        self.nonce = 0;
    }

    /// Mix a preshared key using the Noise psk modifier:
    /// (ck, temp, k) = HKDF(ck, psk); h = HASH(h || temp)
    pub fn mix_psk(&mut self, psk: &[u8; KEY_SIZE]) {
        let (new_ck, temp, new_key) = hkdf_blake2s_3(&*self.chaining_key, psk);
        self.chaining_key = new_ck;
        self.mix_hash(&temp);
        self.key = Some(new_key);
        self.nonce = 0;
    }

    /// Encrypt and authenticate with the current key, h as associated data.
    /// Returns ciphertext || tag.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let key = self.key.as_ref().ok_or(NoiseError::NoKey)?;

        let ciphertext = chacha20poly1305_encrypt(key, self.nonce, &self.hash, plaintext)?;
        self.mix_hash(&ciphertext);
        self.nonce = self.nonce.checked_add(1).ok_or(NoiseError::NonceOverflow)?;

        Ok(ciphertext)
    }

    /// Decrypt and verify with the current key, h as associated data
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let key = self.key.as_ref().ok_or(NoiseError::NoKey)?;

        let plaintext = chacha20poly1305_decrypt(key, self.nonce, &self.hash, ciphertext)?;
        self.mix_hash(ciphertext);
        self.nonce = self.nonce.checked_add(1).ok_or(NoiseError::NonceOverflow)?;

        Ok(plaintext)
    }

    /// Derive the two transport keys.
    ///
    /// Returns (initiator→responder key, responder→initiator key); callers
    /// assign send/receive according to their role.
    pub fn split(
        self,
    ) -> (
        Zeroizing<[u8; KEY_SIZE]>,
        Zeroizing<[u8; KEY_SIZE]>,
    ) {
        hkdf_blake2s(&*self.chaining_key, &[])
    }
}

impl fmt::Debug for SymmetricState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricState")
            .field("has_key", &self.key.is_some())
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Errors during Noise protocol operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoiseError {
    /// No key available for encryption/decryption
    NoKey,
    /// Nonce counter overflow
    NonceOverflow,
    /// Encryption failed
    EncryptionFailed,
    /// Decryption/authentication failed
    DecryptionFailed,
    /// Invalid message length
    InvalidLength { expected: usize, got: usize },
    /// Operation does not match the current handshake state
    InvalidState,
    /// DH computation produced zero (invalid peer key)
    ZeroDhOutput,
    /// Initiation timestamp not newer than the last accepted one
    StaleTimestamp,
    /// Handshake message did not authenticate
    HandshakeFailed,
}

impl fmt::Display for NoiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoiseError::NoKey => write!(f, "no key available"),
            NoiseError::NonceOverflow => write!(f, "nonce counter overflow"),
            NoiseError::EncryptionFailed => write!(f, "encryption failed"),
            NoiseError::DecryptionFailed => write!(f, "decryption failed"),
            NoiseError::InvalidLength { expected, got } => {
                write!(f, "invalid length: expected {}, got {}", expected, got)
            }
            NoiseError::InvalidState => write!(f, "invalid state for operation"),
            NoiseError::ZeroDhOutput => write!(f, "DH produced zero output (invalid peer key)"),
            NoiseError::StaleTimestamp => write!(f, "initiation timestamp is not newer"),
            NoiseError::HandshakeFailed => write!(f, "handshake failed"),
        }
    }
}

impl std::error::Error for NoiseError {}

// ═══════════════════════════════════════════════════════════════════════════
// CRYPTOGRAPHIC PRIMITIVES
// ═══════════════════════════════════════════════════════════════════════════

/// BLAKE2s hash of a single input
pub(crate) fn blake2s_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    use blake2::{Blake2s256, Digest};
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; HASH_SIZE];
    output.copy_from_slice(&result);
    output
}

/// BLAKE2s hash of two concatenated inputs
pub(crate) fn blake2s_hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_SIZE] {
    use blake2::{Blake2s256, Digest};
    let mut hasher = Blake2s256::new();
    hasher.update(a);
    hasher.update(b);
    let result = hasher.finalize();
    let mut output = [0u8; HASH_SIZE];
    output.copy_from_slice(&result);
    output
}

/// HKDF-over-BLAKE2s deriving two keys
fn hkdf_blake2s(
    chaining_key: &[u8],
    input: &[u8],
) -> (Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>) {
    let temp_key = hmac_blake2s(chaining_key, input);

    let output1 = hmac_blake2s(&temp_key, &[0x01]);

    let mut input2 = Vec::with_capacity(KEY_SIZE + 1);
    input2.extend_from_slice(&output1);
    input2.push(0x02);
    let output2 = hmac_blake2s(&temp_key, &input2);

    (Zeroizing::new(output1), Zeroizing::new(output2))
}

/// HKDF-over-BLAKE2s deriving three keys (psk modifier)
fn hkdf_blake2s_3(
    chaining_key: &[u8],
    input: &[u8],
) -> (
    Zeroizing<[u8; KEY_SIZE]>,
    [u8; KEY_SIZE],
    Zeroizing<[u8; KEY_SIZE]>,
) {
    let temp_key = hmac_blake2s(chaining_key, input);

    let output1 = hmac_blake2s(&temp_key, &[0x01]);

    let mut input2 = Vec::with_capacity(KEY_SIZE + 1);
    input2.extend_from_slice(&output1);
    input2.push(0x02);
    let output2 = hmac_blake2s(&temp_key, &input2);

    let mut input3 = Vec::with_capacity(KEY_SIZE + 1);
    input3.extend_from_slice(&output2);
    input3.push(0x03);
    let output3 = hmac_blake2s(&temp_key, &input3);

    (Zeroizing::new(output1), output2, Zeroizing::new(output3))
}

/// HMAC-over-BLAKE2s (keyed BLAKE2s, equivalent for our purposes)
fn hmac_blake2s(key: &[u8], data: &[u8]) -> [u8; KEY_SIZE] {
    use blake2::digest::consts::U32;
    use blake2::digest::{FixedOutput, KeyInit, Update};
    use blake2::Blake2sMac;

    // BLAKE2s keys must be <= 32 bytes; hash longer ones down
    let mac_key: [u8; 32] = if key.len() <= 32 {
        let mut k = [0u8; 32];
        k[..key.len()].copy_from_slice(key);
        k
    } else {
        blake2s_hash(key)
    };

    let mut mac = Blake2sMac::<U32>::new_from_slice(&mac_key)
        .expect("Blake2sMac accepts any key size up to 32 bytes");
    mac.update(data);
    let result = mac.finalize_fixed();

    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&result);
    output
}

/// ChaCha20-Poly1305 AEAD encryption with a counter nonce
pub(crate) fn chacha20poly1305_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: u64,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    use chacha20poly1305::aead::{Aead, Payload};
    use chacha20poly1305::{ChaCha20Poly1305, KeyInit};

    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| NoiseError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(&nonce.to_le_bytes());

    cipher
        .encrypt(&nonce_bytes.into(), Payload { msg: plaintext, aad })
        .map_err(|_| NoiseError::EncryptionFailed)
}

/// ChaCha20-Poly1305 AEAD decryption with a counter nonce
pub(crate) fn chacha20poly1305_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, NoiseError> {
    use chacha20poly1305::aead::{Aead, Payload};
    use chacha20poly1305::{ChaCha20Poly1305, KeyInit};

    let cipher =
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| NoiseError::DecryptionFailed)?;

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..].copy_from_slice(&nonce.to_le_bytes());

    cipher
        .decrypt(&nonce_bytes.into(), Payload { msg: ciphertext, aad })
        .map_err(|_| NoiseError::DecryptionFailed)
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
