//! # Wire Messages
//!
//! The four datagram formats carried over UDP. Every datagram begins with a
//! 4-byte little-endian message type selector.
//!
//! ## Handshake initiation (148 bytes)
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Type (4) = 1                                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Sender Index (4)                                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Ephemeral Public Key (32)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Encrypted Static Key (48 = 32 key + 16 tag)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Encrypted Timestamp (28 = 12 TAI64N + 16 tag)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │ MAC1 (16) │ MAC2 (16)                                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handshake response (92 bytes)
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Type (4) = 2                                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Sender Index (4) │ Receiver Index (4)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Ephemeral Public Key (32)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Encrypted Empty (16)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ MAC1 (16) │ MAC2 (16)                                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cookie reply (64 bytes)
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Type (4) = 3                                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Receiver Index (4)                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Nonce (24, XChaCha20-Poly1305)                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Encrypted Cookie (32 = 16 cookie + 16 tag)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transport (≥ 32 bytes)
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Type (4) = 4                                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Receiver Index (4)                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Counter (8)                                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Ciphertext + Poly1305 Tag (≥ 16)                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport counter doubles as the AEAD nonce (4 zero bytes followed by
//! the counter in little-endian) and feeds the receiver's replay window.

use crate::constants::*;
use crate::error::{ProtocolError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// MESSAGE TYPE
// ═══════════════════════════════════════════════════════════════════════════

/// Classified datagram kind, read from the 4-byte selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Handshake initiation
    Initiation,
    /// Handshake response
    Response,
    /// Cookie reply
    CookieReply,
    /// Transport data (includes keep-alives)
    Transport,
}

impl MessageType {
    /// Classify a datagram by its leading 4 little-endian bytes
    pub fn classify(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < 4 {
            return None;
        }
        match u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]) {
            MESSAGE_INITIATION_TYPE => Some(MessageType::Initiation),
            MESSAGE_RESPONSE_TYPE => Some(MessageType::Response),
            MESSAGE_COOKIE_REPLY_TYPE => Some(MessageType::CookieReply),
            MESSAGE_TRANSPORT_TYPE => Some(MessageType::Transport),
            _ => None,
        }
    }

    /// The wire value of this message type
    pub fn wire_value(&self) -> u32 {
        match self {
            MessageType::Initiation => MESSAGE_INITIATION_TYPE,
            MessageType::Response => MESSAGE_RESPONSE_TYPE,
            MessageType::CookieReply => MESSAGE_COOKIE_REPLY_TYPE,
            MessageType::Transport => MESSAGE_TRANSPORT_TYPE,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HANDSHAKE INITIATION
// ═══════════════════════════════════════════════════════════════════════════

/// Handshake initiation message
#[derive(Clone)]
pub struct MessageInitiation {
    /// Initiator's session index
    pub sender_index: u32,
    /// Initiator's ephemeral X25519 public key
    pub ephemeral_public: [u8; KEY_SIZE],
    /// Encrypted initiator static public key
    pub encrypted_static: [u8; ENCRYPTED_STATIC_SIZE],
    /// Encrypted TAI64N timestamp
    pub encrypted_timestamp: [u8; ENCRYPTED_TIMESTAMP_SIZE],
    /// First MAC, keyed by the responder's static public key
    pub mac1: [u8; MAC_SIZE],
    /// Second MAC, keyed by a cookie (zeros when no cookie is held)
    pub mac2: [u8; MAC_SIZE],
}

impl MessageInitiation {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> [u8; MESSAGE_INITIATION_SIZE] {
        let mut buf = [0u8; MESSAGE_INITIATION_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_INITIATION_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral_public);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    /// Parse from wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MESSAGE_INITIATION_SIZE {
            return Err(ProtocolError::InvalidSize {
                expected: MESSAGE_INITIATION_SIZE,
                got: data.len(),
            });
        }
        let selector = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if selector != MESSAGE_INITIATION_TYPE {
            return Err(ProtocolError::InvalidMessageType(selector));
        }

        let sender_index = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let mut ephemeral_public = [0u8; KEY_SIZE];
        ephemeral_public.copy_from_slice(&data[8..40]);

        let mut encrypted_static = [0u8; ENCRYPTED_STATIC_SIZE];
        encrypted_static.copy_from_slice(&data[40..88]);

        let mut encrypted_timestamp = [0u8; ENCRYPTED_TIMESTAMP_SIZE];
        encrypted_timestamp.copy_from_slice(&data[88..116]);

        let mut mac1 = [0u8; MAC_SIZE];
        mac1.copy_from_slice(&data[116..132]);

        let mut mac2 = [0u8; MAC_SIZE];
        mac2.copy_from_slice(&data[132..148]);

        Ok(Self {
            sender_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1,
            mac2,
        })
    }
}

impl std::fmt::Debug for MessageInitiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInitiation")
            .field("sender_index", &self.sender_index)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HANDSHAKE RESPONSE
// ═══════════════════════════════════════════════════════════════════════════

/// Handshake response message
#[derive(Clone)]
pub struct MessageResponse {
    /// Responder's session index
    pub sender_index: u32,
    /// Initiator's session index, echoed from the initiation
    pub receiver_index: u32,
    /// Responder's ephemeral X25519 public key
    pub ephemeral_public: [u8; KEY_SIZE],
    /// Encrypted empty payload (key confirmation)
    pub encrypted_empty: [u8; ENCRYPTED_EMPTY_SIZE],
    /// First MAC, keyed by the initiator's static public key
    pub mac1: [u8; MAC_SIZE],
    /// Second MAC, keyed by a cookie
    pub mac2: [u8; MAC_SIZE],
}

impl MessageResponse {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> [u8; MESSAGE_RESPONSE_SIZE] {
        let mut buf = [0u8; MESSAGE_RESPONSE_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_RESPONSE_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral_public);
        buf[44..60].copy_from_slice(&self.encrypted_empty);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    /// Parse from wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MESSAGE_RESPONSE_SIZE {
            return Err(ProtocolError::InvalidSize {
                expected: MESSAGE_RESPONSE_SIZE,
                got: data.len(),
            });
        }
        let selector = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if selector != MESSAGE_RESPONSE_TYPE {
            return Err(ProtocolError::InvalidMessageType(selector));
        }

        let sender_index = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let receiver_index = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

        let mut ephemeral_public = [0u8; KEY_SIZE];
        ephemeral_public.copy_from_slice(&data[12..44]);

        let mut encrypted_empty = [0u8; ENCRYPTED_EMPTY_SIZE];
        encrypted_empty.copy_from_slice(&data[44..60]);

        let mut mac1 = [0u8; MAC_SIZE];
        mac1.copy_from_slice(&data[60..76]);

        let mut mac2 = [0u8; MAC_SIZE];
        mac2.copy_from_slice(&data[76..92]);

        Ok(Self {
            sender_index,
            receiver_index,
            ephemeral_public,
            encrypted_empty,
            mac1,
            mac2,
        })
    }
}

impl std::fmt::Debug for MessageResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageResponse")
            .field("sender_index", &self.sender_index)
            .field("receiver_index", &self.receiver_index)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COOKIE REPLY
// ═══════════════════════════════════════════════════════════════════════════

/// Cookie reply message, minted under load for a source without valid MAC2
#[derive(Clone)]
pub struct MessageCookieReply {
    /// Session index of the rejected handshake's sender
    pub receiver_index: u32,
    /// Random XChaCha20-Poly1305 nonce
    pub nonce: [u8; COOKIE_NONCE_SIZE],
    /// Encrypted cookie (16 cookie + 16 tag)
    pub encrypted_cookie: [u8; COOKIE_SIZE + TAG_SIZE],
}

impl MessageCookieReply {
    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> [u8; MESSAGE_COOKIE_REPLY_SIZE] {
        let mut buf = [0u8; MESSAGE_COOKIE_REPLY_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_COOKIE_REPLY_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    /// Parse from wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MESSAGE_COOKIE_REPLY_SIZE {
            return Err(ProtocolError::InvalidSize {
                expected: MESSAGE_COOKIE_REPLY_SIZE,
                got: data.len(),
            });
        }
        let selector = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if selector != MESSAGE_COOKIE_REPLY_TYPE {
            return Err(ProtocolError::InvalidMessageType(selector));
        }

        let receiver_index = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        let mut nonce = [0u8; COOKIE_NONCE_SIZE];
        nonce.copy_from_slice(&data[8..32]);

        let mut encrypted_cookie = [0u8; COOKIE_SIZE + TAG_SIZE];
        encrypted_cookie.copy_from_slice(&data[32..64]);

        Ok(Self {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

impl std::fmt::Debug for MessageCookieReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCookieReply")
            .field("receiver_index", &self.receiver_index)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Parsed transport message header
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    /// Receiver's session index
    pub receiver_index: u32,
    /// Packet counter; nonce and replay-window input
    pub counter: u64,
}

impl TransportHeader {
    /// Serialize the header into the first 16 bytes of a transport message
    pub fn to_bytes(&self) -> [u8; MESSAGE_TRANSPORT_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_TRANSPORT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MESSAGE_TRANSPORT_TYPE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
        buf
    }

    /// Parse the header of a transport message
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MESSAGE_TRANSPORT_HEADER_SIZE {
            return Err(ProtocolError::PacketTooSmall {
                min: MESSAGE_TRANSPORT_HEADER_SIZE,
                got: data.len(),
            });
        }
        let selector = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if selector != MESSAGE_TRANSPORT_TYPE {
            return Err(ProtocolError::InvalidMessageType(selector));
        }
        Ok(Self {
            receiver_index: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            counter: u64::from_le_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
        })
    }
}

/// AEAD nonce for a transport counter: 4 zero bytes, then the counter LE
pub fn transport_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

// ═══════════════════════════════════════════════════════════════════════════
// TAI64N TIMESTAMP
// ═══════════════════════════════════════════════════════════════════════════

/// TAI64N timestamp carried in the initiation for initiation-replay defence
///
/// 8 bytes of seconds (offset by 2^62) followed by 4 bytes of nanoseconds,
/// both big-endian, so byte-wise comparison orders timestamps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tai64n([u8; TAI64N_SIZE]);

impl Tai64n {
    const TAI64_EPOCH: u64 = 1u64 << 62;

    /// Timestamp for the current time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let seconds = duration.as_secs() + Self::TAI64_EPOCH;
        let nanos = duration.subsec_nanos();

        let mut bytes = [0u8; TAI64N_SIZE];
        bytes[0..8].copy_from_slice(&seconds.to_be_bytes());
        bytes[8..12].copy_from_slice(&nanos.to_be_bytes());
        Self(bytes)
    }

    /// Parse from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TAI64N_SIZE {
            return None;
        }
        let mut arr = [0u8; TAI64N_SIZE];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; TAI64N_SIZE] {
        &self.0
    }

    /// Strictly-after comparison
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.0 > other.0
    }
}

impl std::fmt::Debug for Tai64n {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tai64n({:02x?})", &self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            MessageType::classify(&1u32.to_le_bytes()),
            Some(MessageType::Initiation)
        );
        assert_eq!(
            MessageType::classify(&2u32.to_le_bytes()),
            Some(MessageType::Response)
        );
        assert_eq!(
            MessageType::classify(&3u32.to_le_bytes()),
            Some(MessageType::CookieReply)
        );
        assert_eq!(
            MessageType::classify(&4u32.to_le_bytes()),
            Some(MessageType::Transport)
        );
        assert_eq!(MessageType::classify(&9u32.to_le_bytes()), None);
        assert_eq!(MessageType::classify(&[1, 0]), None);
    }

    #[test]
    fn test_initiation_roundtrip() {
        let msg = MessageInitiation {
            sender_index: 0x12345678,
            ephemeral_public: [0xAA; 32],
            encrypted_static: [0xBB; 48],
            encrypted_timestamp: [0xCC; 28],
            mac1: [0xDD; 16],
            mac2: [0xEE; 16],
        };

        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_INITIATION_SIZE);

        let restored = MessageInitiation::from_bytes(&bytes).unwrap();
        assert_eq!(restored.sender_index, msg.sender_index);
        assert_eq!(restored.ephemeral_public, msg.ephemeral_public);
        assert_eq!(restored.encrypted_static, msg.encrypted_static);
        assert_eq!(restored.encrypted_timestamp, msg.encrypted_timestamp);
        assert_eq!(restored.mac1, msg.mac1);
        assert_eq!(restored.mac2, msg.mac2);
    }

    #[test]
    fn test_initiation_wrong_selector() {
        let msg = MessageInitiation {
            sender_index: 1,
            ephemeral_public: [0; 32],
            encrypted_static: [0; 48],
            encrypted_timestamp: [0; 28],
            mac1: [0; 16],
            mac2: [0; 16],
        };
        let mut bytes = msg.to_bytes();
        bytes[0] = 2;
        assert!(MessageInitiation::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let msg = MessageResponse {
            sender_index: 0x01020304,
            receiver_index: 0x05060708,
            ephemeral_public: [0xAA; 32],
            encrypted_empty: [0xBB; 16],
            mac1: [0xCC; 16],
            mac2: [0xDD; 16],
        };

        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_RESPONSE_SIZE);

        let restored = MessageResponse::from_bytes(&bytes).unwrap();
        assert_eq!(restored.sender_index, msg.sender_index);
        assert_eq!(restored.receiver_index, msg.receiver_index);
        assert_eq!(restored.ephemeral_public, msg.ephemeral_public);
        assert_eq!(restored.encrypted_empty, msg.encrypted_empty);
    }

    #[test]
    fn test_cookie_reply_roundtrip() {
        let msg = MessageCookieReply {
            receiver_index: 0x11223344,
            nonce: [0xAA; 24],
            encrypted_cookie: [0xBB; 32],
        };

        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MESSAGE_COOKIE_REPLY_SIZE);

        let restored = MessageCookieReply::from_bytes(&bytes).unwrap();
        assert_eq!(restored.receiver_index, msg.receiver_index);
        assert_eq!(restored.nonce, msg.nonce);
        assert_eq!(restored.encrypted_cookie, msg.encrypted_cookie);
    }

    #[test]
    fn test_cookie_reply_wrong_size() {
        assert!(MessageCookieReply::from_bytes(&[0u8; 63]).is_err());
        assert!(MessageCookieReply::from_bytes(&[0u8; 65]).is_err());
    }

    #[test]
    fn test_transport_header_roundtrip() {
        let header = TransportHeader {
            receiver_index: 0xDEADBEEF,
            counter: 0x0102030405060708,
        };
        let bytes = header.to_bytes();
        let restored = TransportHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored.receiver_index, header.receiver_index);
        assert_eq!(restored.counter, header.counter);
    }

    #[test]
    fn test_transport_nonce_layout() {
        let nonce = transport_nonce(0x0102030405060708);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..12], &0x0102030405060708u64.to_le_bytes());
    }

    #[test]
    fn test_tai64n_ordering() {
        let ts1 = Tai64n::now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let ts2 = Tai64n::now();

        assert!(ts2.is_newer_than(&ts1));
        assert!(!ts1.is_newer_than(&ts2));
        assert!(!ts1.is_newer_than(&ts1));
    }

    #[test]
    fn test_tai64n_roundtrip() {
        let ts = Tai64n::now();
        let restored = Tai64n::from_bytes(ts.as_bytes()).unwrap();
        assert_eq!(ts, restored);
        assert!(Tai64n::from_bytes(&[0u8; 8]).is_none());
    }
}
