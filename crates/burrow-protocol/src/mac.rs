//! # MAC1/MAC2 DoS Protection
//!
//! Keyed MACs appended to every handshake datagram, and the cookie exchange
//! that backs MAC2 under load.
//!
//! ## MAC1 - Basic Authentication
//!
//! MAC1 binds a handshake message to the receiver's static public key,
//! preventing blind injection:
//!
//! ```text
//! mac1_key = HASH(LABEL_MAC1 || receiver_static_public)
//! MAC1 = KEYED_HASH(mac1_key, msg[..len-32])
//! ```
//!
//! ## MAC2 - Cookie-based Rate Limiting
//!
//! Under load the receiver additionally requires MAC2, keyed by a short-lived
//! cookie derived from the sender's source address and a rotating secret:
//!
//! ```text
//! cookie = KEYED_HASH(secret, source_ip || source_port)
//! MAC2 = KEYED_HASH(cookie, msg[..len-16])
//! ```
//!
//! A sender without a valid MAC2 receives a cookie reply: the cookie,
//! encrypted with XChaCha20-Poly1305 under `HASH(LABEL_COOKIE || pub)` with
//! the offending message's MAC1 as associated data.

use crate::constants::{
    COOKIE_NONCE_SIZE, COOKIE_REFRESH_TIME_SECS, COOKIE_SECRET_SIZE, COOKIE_SIZE, KEY_SIZE,
    MAC_SIZE, TAG_SIZE,
};
use crate::messages::MessageCookieReply;
use crate::noise::NoiseError;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie encryption key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

// ═══════════════════════════════════════════════════════════════════════════
// COOKIE CHECKER (receiver side)
// ═══════════════════════════════════════════════════════════════════════════

/// Device-side MAC verification and cookie minting.
///
/// Keyed by the device's own static public key; rebuilt when the private key
/// changes.
pub struct CookieChecker {
    mac1_key: [u8; KEY_SIZE],
    cookie_encryption_key: [u8; KEY_SIZE],
    secret: [u8; COOKIE_SECRET_SIZE],
    secret_previous: [u8; COOKIE_SECRET_SIZE],
    secret_birth: Instant,
}

impl CookieChecker {
    /// Create a checker for a device with the given static public key
    pub fn new(device_public: &[u8; KEY_SIZE]) -> Self {
        let mut secret = [0u8; COOKIE_SECRET_SIZE];
        OsRng.fill_bytes(&mut secret);
        let mut secret_previous = [0u8; COOKIE_SECRET_SIZE];
        OsRng.fill_bytes(&mut secret_previous);

        Self {
            mac1_key: blake2s_hash_two(LABEL_MAC1, device_public),
            cookie_encryption_key: blake2s_hash_two(LABEL_COOKIE, device_public),
            secret,
            secret_previous,
            secret_birth: Instant::now(),
        }
    }

    /// Verify MAC1 of a raw handshake message
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        if msg.len() < 2 * MAC_SIZE {
            return false;
        }
        let boundary = msg.len() - 2 * MAC_SIZE;
        let expected = mac16(&self.mac1_key, &msg[..boundary]);
        constant_time_compare(&expected, &msg[boundary..boundary + MAC_SIZE])
    }

    /// Verify MAC2 of a raw handshake message against the sender's source
    /// address. Both the current and the just-previous secret validate.
    pub fn check_mac2(&mut self, msg: &[u8], source: &SocketAddr) -> bool {
        if msg.len() < 2 * MAC_SIZE {
            return false;
        }
        self.rotate_if_stale();

        let boundary = msg.len() - MAC_SIZE;
        let received = &msg[boundary..];
        let addr = source_bytes(source);

        for secret in [&self.secret, &self.secret_previous] {
            let cookie = cookie_for(secret, &addr);
            let expected = mac16_from_cookie(&cookie, &msg[..boundary]);
            if constant_time_compare(&expected, received) {
                return true;
            }
        }
        false
    }

    /// Mint a cookie reply for a message that failed the MAC2 gate.
    ///
    /// `msg` is the offending handshake message (its MAC1 becomes the
    /// associated data), `sender_index` the index it carried.
    pub fn create_cookie_reply(
        &mut self,
        msg: &[u8],
        sender_index: u32,
        source: &SocketAddr,
    ) -> Result<MessageCookieReply, NoiseError> {
        if msg.len() < 2 * MAC_SIZE {
            return Err(NoiseError::EncryptionFailed);
        }
        self.rotate_if_stale();

        let mac1_offset = msg.len() - 2 * MAC_SIZE;
        let mac1 = &msg[mac1_offset..mac1_offset + MAC_SIZE];

        let cookie = cookie_for(&self.secret, &source_bytes(source));

        let mut nonce = [0u8; COOKIE_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.cookie_encryption_key)
            .map_err(|_| NoiseError::EncryptionFailed)?;
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &cookie,
                    aad: mac1,
                },
            )
            .map_err(|_| NoiseError::EncryptionFailed)?;

        let mut encrypted_cookie = [0u8; COOKIE_SIZE + TAG_SIZE];
        encrypted_cookie.copy_from_slice(&sealed);

        Ok(MessageCookieReply {
            receiver_index: sender_index,
            nonce,
            encrypted_cookie,
        })
    }

    /// Rotate the cookie secret when it has outlived the refresh interval
    pub fn rotate_if_stale(&mut self) {
        if self.secret_birth.elapsed() < Duration::from_secs(COOKIE_REFRESH_TIME_SECS) {
            return;
        }
        self.secret_previous = self.secret;
        OsRng.fill_bytes(&mut self.secret);
        self.secret_birth = Instant::now();
    }
}

impl std::fmt::Debug for CookieChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieChecker").finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COOKIE GENERATOR (sender side)
// ═══════════════════════════════════════════════════════════════════════════

/// Peer-side MAC production: appends MAC1 (and MAC2 while a fresh cookie is
/// held) to outgoing handshake messages, and installs cookies received in
/// cookie replies.
pub struct CookieGenerator {
    mac1_key: [u8; KEY_SIZE],
    cookie_decryption_key: [u8; KEY_SIZE],
    last_mac1: Option<[u8; MAC_SIZE]>,
    cookie: Option<[u8; COOKIE_SIZE]>,
    cookie_birth: Instant,
}

impl CookieGenerator {
    /// Create a generator for handshakes addressed to `peer_public`
    pub fn new(peer_public: &[u8; KEY_SIZE]) -> Self {
        Self {
            mac1_key: blake2s_hash_two(LABEL_MAC1, peer_public),
            cookie_decryption_key: blake2s_hash_two(LABEL_COOKIE, peer_public),
            last_mac1: None,
            cookie: None,
            cookie_birth: Instant::now(),
        }
    }

    /// Fill in the trailing MAC1/MAC2 fields of a serialized handshake
    /// message. MAC2 stays zero unless a fresh cookie is held.
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        if msg.len() < 2 * MAC_SIZE {
            return;
        }
        let mac1_offset = msg.len() - 2 * MAC_SIZE;
        let mac2_offset = msg.len() - MAC_SIZE;

        let mac1 = mac16(&self.mac1_key, &msg[..mac1_offset]);
        msg[mac1_offset..mac2_offset].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        if let Some(cookie) = self.fresh_cookie() {
            let mac2 = mac16_from_cookie(&cookie, &msg[..mac2_offset]);
            msg[mac2_offset..].copy_from_slice(&mac2);
        }
    }

    /// Decrypt and install the cookie from a received cookie reply
    pub fn consume_reply(&mut self, reply: &MessageCookieReply) -> Result<(), NoiseError> {
        let mac1 = self.last_mac1.ok_or(NoiseError::DecryptionFailed)?;

        let cipher = XChaCha20Poly1305::new_from_slice(&self.cookie_decryption_key)
            .map_err(|_| NoiseError::DecryptionFailed)?;
        let opened = cipher
            .decrypt(
                XNonce::from_slice(&reply.nonce),
                Payload {
                    msg: &reply.encrypted_cookie,
                    aad: &mac1,
                },
            )
            .map_err(|_| NoiseError::DecryptionFailed)?;

        if opened.len() != COOKIE_SIZE {
            return Err(NoiseError::DecryptionFailed);
        }
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(&opened);
        self.cookie = Some(cookie);
        self.cookie_birth = Instant::now();
        Ok(())
    }

    /// Whether a cookie is currently held (fresh or not)
    pub fn has_cookie(&self) -> bool {
        self.cookie.is_some()
    }

    fn fresh_cookie(&self) -> Option<[u8; COOKIE_SIZE]> {
        let cookie = self.cookie?;
        if self.cookie_birth.elapsed() >= Duration::from_secs(COOKIE_REFRESH_TIME_SECS) {
            return None;
        }
        Some(cookie)
    }
}

impl std::fmt::Debug for CookieGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieGenerator")
            .field("has_cookie", &self.cookie.is_some())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Cookie for a source address under a given secret
fn cookie_for(secret: &[u8; COOKIE_SECRET_SIZE], addr: &[u8]) -> [u8; COOKIE_SIZE] {
    let full = keyed_blake2s(secret, addr);
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie.copy_from_slice(&full[..COOKIE_SIZE]);
    cookie
}

/// Source address bytes: ip octets followed by the big-endian port
fn source_bytes(source: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match source.ip() {
        std::net::IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        std::net::IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&source.port().to_be_bytes());
    out
}

/// Truncated keyed BLAKE2s with a 32-byte key
fn mac16(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; MAC_SIZE] {
    let full = keyed_blake2s(key, data);
    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&full[..MAC_SIZE]);
    mac
}

/// Truncated keyed BLAKE2s with a 16-byte cookie as key, zero-padded
fn mac16_from_cookie(cookie: &[u8; COOKIE_SIZE], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    key[..COOKIE_SIZE].copy_from_slice(cookie);
    mac16(&key, data)
}

/// BLAKE2s hash of two inputs concatenated
fn blake2s_hash_two(a: &[u8], b: &[u8]) -> [u8; KEY_SIZE] {
    use blake2::{Blake2s256, Digest};
    let mut hasher = Blake2s256::new();
    hasher.update(a);
    hasher.update(b);
    let result = hasher.finalize();
    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&result);
    output
}

/// Keyed BLAKE2s (keyed mode)
fn keyed_blake2s(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; KEY_SIZE] {
    use blake2::digest::consts::U32;
    use blake2::digest::{FixedOutput, KeyInit, Update};
    use blake2::Blake2sMac;

    let mut mac = Blake2sMac::<U32>::new_from_slice(key)
        .expect("Blake2sMac accepts 32-byte keys");
    mac.update(data);
    let result = mac.finalize_fixed();

    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&result);
    output
}

/// Constant-time comparison
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
