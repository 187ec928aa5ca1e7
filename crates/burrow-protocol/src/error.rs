//! # Error Module
//!
//! Error types for wire parsing and serialization.

use std::fmt;

/// Errors raised while parsing or building wire messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Datagram shorter than the minimum for its message type
    PacketTooSmall { min: usize, got: usize },
    /// Datagram does not match the fixed size of its message type
    InvalidSize { expected: usize, got: usize },
    /// The 4-byte selector is not a known message type
    InvalidMessageType(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PacketTooSmall { min, got } => {
                write!(f, "packet too small: minimum {}, got {}", min, got)
            }
            ProtocolError::InvalidSize { expected, got } => {
                write!(f, "invalid packet size: expected {}, got {}", expected, got)
            }
            ProtocolError::InvalidMessageType(t) => {
                write!(f, "invalid message type: {}", t)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

pub type Result<T> = std::result::Result<T, ProtocolError>;
