//! # burrow-protocol
//!
//! Wire formats and cryptographic state machines for the burrow tunnel.
//!
//! This crate provides:
//! - Protocol constants (message types, sizes, timing limits)
//! - The four UDP datagram formats and their (de)serialization
//! - Sliding-window replay protection for transport counters
//! - MAC1/MAC2 handshake authentication and the cookie exchange
//! - The Noise-IKpsk2 handshake yielding directional session keys
//!
//! The engine that schedules these pieces lives in `burrow-core`.

mod constants;
mod error;
mod messages;
mod replay;
pub mod handshake;
pub mod mac;
pub mod noise;

pub use constants::*;
pub use error::{ProtocolError, Result};
pub use handshake::{
    consume_initiation, derive_public, Handshake, IncomingInitiation, SessionKeys, StaticKeys,
};
pub use mac::{CookieChecker, CookieGenerator, LABEL_COOKIE, LABEL_MAC1};
pub use messages::{
    transport_nonce, MessageCookieReply, MessageInitiation, MessageResponse, MessageType, Tai64n,
    TransportHeader,
};
pub use noise::{NoiseError, SymmetricState, NOISE_CONSTRUCTION, NOISE_IDENTIFIER};
pub use replay::{ReplayFilter, WINDOW_SIZE};
