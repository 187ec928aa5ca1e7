//! # Key-Pair State
//!
//! A transport key-pair derived from a completed handshake, and the per-peer
//! previous/current/next slot arrangement that accommodates in-flight packets
//! during rotation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_protocol::{
    transport_nonce, ReplayFilter, SessionKeys, REJECT_AFTER_TIME_SECS, TAG_SIZE,
};
use chacha20poly1305::aead::{Aead, AeadInPlace, Payload};
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce, Tag};
use parking_lot::Mutex;

// ═══════════════════════════════════════════════════════════════════════════
// KEY PAIR
// ═══════════════════════════════════════════════════════════════════════════

/// Directional AEAD keys plus the receive-side replay filter and the session
/// indices carried by transport headers
pub struct KeyPair {
    send: ChaCha20Poly1305,
    receive: ChaCha20Poly1305,
    /// Counter for the next outbound packet
    pub send_counter: AtomicU64,
    /// Anti-replay window for the receive direction; touched only by the
    /// per-peer sequential receiver
    pub replay_filter: Mutex<ReplayFilter>,
    /// When the handshake completed
    pub created: Instant,
    /// Our receiver id, indexed in the session index
    pub local_index: u32,
    /// The id the other side expects in transport headers
    pub remote_index: u32,
    /// Whether we initiated the handshake that derived this pair
    pub is_initiator: bool,
}

impl KeyPair {
    /// Build a key-pair from freshly derived session keys
    pub fn new(session: SessionKeys) -> Self {
        Self {
            send: ChaCha20Poly1305::new_from_slice(&*session.send)
                .expect("session keys are 32 bytes"),
            receive: ChaCha20Poly1305::new_from_slice(&*session.receive)
                .expect("session keys are 32 bytes"),
            send_counter: AtomicU64::new(0),
            replay_filter: Mutex::new(ReplayFilter::new()),
            created: Instant::now(),
            local_index: session.local_index,
            remote_index: session.remote_index,
            is_initiator: session.is_initiator,
        }
    }

    /// Claim the next outbound counter
    pub fn next_counter(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Encrypt an outbound payload under this pair's send key.
    /// Returns ciphertext || tag.
    pub fn encrypt(&self, counter: u64, plaintext: &[u8]) -> Option<Vec<u8>> {
        let nonce = transport_nonce(counter);
        self.send
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .ok()
    }

    /// Authenticated in-place decryption of `ciphertext || tag`.
    /// On success returns the plaintext length at the front of `data`.
    pub fn open_in_place(&self, counter: u64, data: &mut [u8]) -> Result<usize, ()> {
        if data.len() < TAG_SIZE {
            return Err(());
        }
        let nonce = transport_nonce(counter);
        let boundary = data.len() - TAG_SIZE;
        let (content, tag) = data.split_at_mut(boundary);
        self.receive
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &[],
                content,
                Tag::from_slice(tag),
            )
            .map_err(|_| ())?;
        Ok(boundary)
    }

    /// A key-pair older than the rejection deadline is unusable
    pub fn expired(&self) -> bool {
        self.created.elapsed() >= Duration::from_secs(REJECT_AFTER_TIME_SECS)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("local_index", &format_args!("{:#x}", self.local_index))
            .field("remote_index", &format_args!("{:#x}", self.remote_index))
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRI-SLOT ROTATION
// ═══════════════════════════════════════════════════════════════════════════

/// The previous/current/next key-pair slots of one peer.
///
/// Invariants: `next` holds a freshly derived pair that has not yet carried
/// inbound data; the first accepted inbound packet under `next` promotes it
/// (`previous ← current ← next`), evicting the prior `previous`.
#[derive(Default)]
pub struct KeyPairs {
    pub previous: Option<Arc<KeyPair>>,
    pub current: Option<Arc<KeyPair>>,
    pub next: Option<Arc<KeyPair>>,
}

impl KeyPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly derived pair into `next`, returning the pair it
    /// displaced (to be evicted from the session index)
    pub fn install_next(&mut self, kp: Arc<KeyPair>) -> Option<Arc<KeyPair>> {
        self.next.replace(kp)
    }

    /// True if `kp` currently occupies the `next` slot
    pub fn is_next(&self, kp: &Arc<KeyPair>) -> bool {
        self.next.as_ref().map_or(false, |n| Arc::ptr_eq(n, kp))
    }

    /// Promote `next`: `previous ← current; current ← next; next ← ∅`.
    /// Returns the evicted prior `previous`, if any.
    pub fn promote(&mut self) -> Option<Arc<KeyPair>> {
        let evicted = self.previous.take();
        self.previous = self.current.take();
        self.current = self.next.take();
        evicted
    }

    /// The pair outbound traffic should use: `current`, or `next` when no
    /// inbound packet has confirmed the fresh pair yet
    pub fn send_keypair(&self) -> Option<Arc<KeyPair>> {
        self.current.clone().or_else(|| self.next.clone())
    }

    /// Drain every slot, returning the pairs for index eviction
    pub fn clear(&mut self) -> Vec<Arc<KeyPair>> {
        [
            self.previous.take(),
            self.current.take(),
            self.next.take(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl std::fmt::Debug for KeyPairs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairs")
            .field("previous", &self.previous.is_some())
            .field("current", &self.current.is_some())
            .field("next", &self.next.is_some())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn session(local: u32, remote: u32, initiator: bool) -> SessionKeys {
        SessionKeys {
            send: Zeroizing::new([0x11; 32]),
            receive: Zeroizing::new([0x22; 32]),
            local_index: local,
            remote_index: remote,
            is_initiator: initiator,
        }
    }

    fn keypair(local: u32) -> Arc<KeyPair> {
        Arc::new(KeyPair::new(session(local, local + 1, false)))
    }

    #[test]
    fn test_encrypt_open_roundtrip() {
        // mirror sessions: my send key is your receive key
        let a = KeyPair::new(SessionKeys {
            send: Zeroizing::new([0xAA; 32]),
            receive: Zeroizing::new([0xBB; 32]),
            local_index: 1,
            remote_index: 2,
            is_initiator: true,
        });
        let b = KeyPair::new(SessionKeys {
            send: Zeroizing::new([0xBB; 32]),
            receive: Zeroizing::new([0xAA; 32]),
            local_index: 2,
            remote_index: 1,
            is_initiator: false,
        });

        let counter = a.next_counter();
        let mut sealed = a.encrypt(counter, b"inner packet").unwrap();
        let len = b.open_in_place(counter, &mut sealed).unwrap();
        assert_eq!(&sealed[..len], b"inner packet");
    }

    #[test]
    fn test_open_wrong_counter_fails() {
        let kp = KeyPair::new(session(1, 2, true));
        let rx = KeyPair::new(SessionKeys {
            send: Zeroizing::new([0x22; 32]),
            receive: Zeroizing::new([0x11; 32]),
            local_index: 2,
            remote_index: 1,
            is_initiator: false,
        });

        let mut sealed = kp.encrypt(7, b"payload").unwrap();
        assert!(rx.open_in_place(8, &mut sealed).is_err());
    }

    #[test]
    fn test_open_too_short() {
        let kp = KeyPair::new(session(1, 2, true));
        let mut short = [0u8; TAG_SIZE - 1];
        assert!(kp.open_in_place(0, &mut short).is_err());
    }

    #[test]
    fn test_counters_monotonic() {
        let kp = KeyPair::new(session(1, 2, true));
        assert_eq!(kp.next_counter(), 0);
        assert_eq!(kp.next_counter(), 1);
        assert_eq!(kp.next_counter(), 2);
    }

    #[test]
    fn test_promotion_rotates_slots() {
        let mut slots = KeyPairs::new();

        let first = keypair(1);
        assert!(slots.install_next(Arc::clone(&first)).is_none());
        assert!(slots.is_next(&first));

        // first inbound packet under `next` promotes it
        assert!(slots.promote().is_none());
        assert!(slots.current.as_ref().map(|c| Arc::ptr_eq(c, &first)).unwrap());
        assert!(slots.next.is_none());
        assert!(slots.previous.is_none());

        // a rekey installs a second pair, promotion shifts the first down
        let second = keypair(2);
        slots.install_next(Arc::clone(&second));
        assert!(slots.promote().is_none());
        assert!(slots.previous.as_ref().map(|p| Arc::ptr_eq(p, &first)).unwrap());
        assert!(slots.current.as_ref().map(|c| Arc::ptr_eq(c, &second)).unwrap());
        assert!(slots.next.is_none());

        // the third promotion finally evicts the first pair
        let third = keypair(3);
        slots.install_next(Arc::clone(&third));
        let evicted = slots.promote().unwrap();
        assert!(Arc::ptr_eq(&evicted, &first));
    }

    #[test]
    fn test_install_next_displaces_unconfirmed_pair() {
        let mut slots = KeyPairs::new();
        let stale = keypair(1);
        let fresh = keypair(2);

        slots.install_next(Arc::clone(&stale));
        let displaced = slots.install_next(Arc::clone(&fresh)).unwrap();
        assert!(Arc::ptr_eq(&displaced, &stale));
        assert!(slots.is_next(&fresh));
    }

    #[test]
    fn test_send_keypair_prefers_current() {
        let mut slots = KeyPairs::new();
        assert!(slots.send_keypair().is_none());

        let fresh = keypair(1);
        slots.install_next(Arc::clone(&fresh));
        // nothing confirmed yet: sending may use the fresh pair
        assert!(Arc::ptr_eq(&slots.send_keypair().unwrap(), &fresh));

        slots.promote();
        let newer = keypair(2);
        slots.install_next(Arc::clone(&newer));
        // once a pair is current, it wins over the unconfirmed next
        assert!(Arc::ptr_eq(&slots.send_keypair().unwrap(), &fresh));
    }

    #[test]
    fn test_clear_returns_all() {
        let mut slots = KeyPairs::new();
        slots.install_next(keypair(1));
        slots.promote();
        slots.install_next(keypair(2));
        assert_eq!(slots.clear().len(), 2);
        assert!(slots.send_keypair().is_none());
    }
}
