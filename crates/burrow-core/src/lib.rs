//! # burrow-core
//!
//! The burrow tunnel engine: a user-space layer-3 data plane multiplexing
//! authenticated peers over one UDP socket.
//!
//! ## Architecture
//!
//! ```text
//! UDP socket ─▶ demultiplexer ─┬▶ handshake queue ─▶ handshake pump
//!                              ├▶ cookie replies  ─▶ peer cookie state
//!                              └▶ transport ─┬▶ decryption workers (parallel)
//!                                            └▶ per-peer receiver (in order)
//!                                                        │
//!                                                        ▼
//!                                              tunnel writer ─▶ TUN
//! ```
//!
//! Inbound transport elements ride two queues at once; a per-element latch
//! lets the sequential receiver wait for whichever worker decrypts it.
//! Buffers come from a shared pool and follow linear ownership. The control
//! protocol ([`uapi`]) mutates the peer table, routing table and device key,
//! which parameterise everything else.

mod buffer;
mod device;
mod handshake;
mod index;
mod keypair;
mod peer;
mod queue;
mod ratelimit;
mod receive;
mod routing;
mod send;
mod timers;
mod tun;
pub mod uapi;

pub use buffer::{BufferPool, MessageBuffer};
pub use device::{Device, DeviceConfig};
pub use keypair::{KeyPair, KeyPairs};
pub use peer::Peer;
pub use routing::{parse_cidr, RoutingTable};
pub use tun::TunDevice;
