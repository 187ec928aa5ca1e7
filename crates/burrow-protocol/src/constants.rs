//! # Constants
//!
//! Shared constants for the tunnel wire protocol.

// ═══════════════════════════════════════════════════════════════════════════
// MESSAGE TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Handshake initiation message type (first 4 bytes, little-endian)
pub const MESSAGE_INITIATION_TYPE: u32 = 1;

/// Handshake response message type
pub const MESSAGE_RESPONSE_TYPE: u32 = 2;

/// Cookie reply message type
pub const MESSAGE_COOKIE_REPLY_TYPE: u32 = 3;

/// Transport (data) message type
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;

// ═══════════════════════════════════════════════════════════════════════════
// KEY AND TAG SIZES
// ═══════════════════════════════════════════════════════════════════════════

/// X25519 key size in bytes (private, public and shared secrets)
pub const KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// MAC size for handshake packets (truncated keyed BLAKE2s)
pub const MAC_SIZE: usize = 16;

/// Cookie size in bytes
pub const COOKIE_SIZE: usize = 16;

/// Cookie secret size in bytes
pub const COOKIE_SECRET_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size used by the cookie reply
pub const COOKIE_NONCE_SIZE: usize = 24;

/// TAI64N timestamp size in bytes
pub const TAI64N_SIZE: usize = 12;

// ═══════════════════════════════════════════════════════════════════════════
// MESSAGE SIZES AND OFFSETS
// ═══════════════════════════════════════════════════════════════════════════

/// Handshake initiation size:
/// type(4) + sender(4) + ephemeral(32) + enc_static(48) + enc_timestamp(28)
/// + mac1(16) + mac2(16)
pub const MESSAGE_INITIATION_SIZE: usize = 148;

/// Handshake response size:
/// type(4) + sender(4) + receiver(4) + ephemeral(32) + enc_empty(16)
/// + mac1(16) + mac2(16)
pub const MESSAGE_RESPONSE_SIZE: usize = 92;

/// Cookie reply size:
/// type(4) + receiver(4) + nonce(24) + enc_cookie(32)
pub const MESSAGE_COOKIE_REPLY_SIZE: usize = 64;

/// Transport header size: type(4) + receiver(4) + counter(8)
pub const MESSAGE_TRANSPORT_HEADER_SIZE: usize = 16;

/// Offset of the receiver id field in a transport message
pub const MESSAGE_TRANSPORT_OFFSET_RECEIVER: usize = 4;

/// Offset of the counter field in a transport message
pub const MESSAGE_TRANSPORT_OFFSET_COUNTER: usize = 8;

/// Offset of the ciphertext in a transport message
pub const MESSAGE_TRANSPORT_OFFSET_CONTENT: usize = 16;

/// Minimum transport message size (header + tag of an empty keep-alive)
pub const MESSAGE_TRANSPORT_MIN_SIZE: usize = MESSAGE_TRANSPORT_HEADER_SIZE + TAG_SIZE;

/// Smallest datagram the receiver will look at
pub const MIN_MESSAGE_SIZE: usize = MESSAGE_TRANSPORT_MIN_SIZE;

/// Largest datagram the engine handles; also the pooled buffer capacity
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Encrypted static key size (32-byte key + 16-byte tag)
pub const ENCRYPTED_STATIC_SIZE: usize = KEY_SIZE + TAG_SIZE;

/// Encrypted timestamp size (12-byte TAI64N + 16-byte tag)
pub const ENCRYPTED_TIMESTAMP_SIZE: usize = TAI64N_SIZE + TAG_SIZE;

/// Encrypted empty payload size (key-confirmation tag only)
pub const ENCRYPTED_EMPTY_SIZE: usize = TAG_SIZE;

// ═══════════════════════════════════════════════════════════════════════════
// TIMING AND USAGE LIMITS
// ═══════════════════════════════════════════════════════════════════════════

/// Initiate a new handshake after a key-pair has sent for this long (seconds)
pub const REKEY_AFTER_TIME_SECS: u64 = 120;

/// A key-pair is unusable for inbound after this long (seconds)
pub const REJECT_AFTER_TIME_SECS: u64 = 180;

/// Minimum interval between handshake initiations to a peer (seconds)
pub const REKEY_TIMEOUT_SECS: u64 = 5;

/// Passive keep-alive deadline (seconds)
pub const KEEPALIVE_TIMEOUT_SECS: u64 = 10;

/// Cookie secret rotation interval; minted cookies live this long (seconds)
pub const COOKIE_REFRESH_TIME_SECS: u64 = 120;

/// Rekey after this many messages on a single key-pair
pub const REKEY_AFTER_MESSAGES: u64 = u64::MAX - (1 << 16);

/// Hard upper bound on transport counters for a single key-pair
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 4);

/// Anti-replay window bitmap size in counters; effective window is one
/// word smaller
pub const REPLAY_BITS_TOTAL: u64 = 2048;
