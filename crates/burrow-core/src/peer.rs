//! # Peer
//!
//! A remote identified by its static public key: endpoint, handshake state,
//! cookie state, key-pair slots, per-peer inbound queue and statistics.
//! Peers are owned by the device's peer table; every other structure holds
//! non-owning references back.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::keypair::KeyPairs;
use crate::queue::{InboundElement, QUEUE_PEER_INBOUND_SIZE};
use crate::timers::PeerTimers;
use burrow_protocol::{CookieGenerator, Handshake, KEY_SIZE};

/// A configured remote peer
pub struct Peer {
    /// The peer's static public key; its identity
    pub public_key: [u8; KEY_SIZE],
    /// Last known UDP endpoint; learned from authenticated initiations or
    /// set by configuration
    pub(crate) endpoint: Mutex<Option<SocketAddr>>,
    /// Noise handshake state
    pub(crate) handshake: Mutex<Handshake>,
    /// MAC state for handshake messages we send to this peer
    pub(crate) cookie_generator: Mutex<CookieGenerator>,
    /// previous/current/next transport key-pairs
    pub(crate) keypairs: Mutex<KeyPairs>,
    /// Timer state driven by the data plane
    pub(crate) timers: PeerTimers,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    /// Keep-alive interval in seconds; 0 disables
    pub(crate) persistent_keepalive: AtomicU64,
    /// Per-peer inbound queue feeding the sequential receiver
    pub(crate) inbound_tx: Sender<Arc<InboundElement>>,
    pub(crate) inbound_rx: Receiver<Arc<InboundElement>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    pub(crate) stop_rx: Receiver<()>,
    pub(crate) thread: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Create a peer for a static public key. The sequential receiver task
    /// is spawned by the device when it adopts the peer.
    pub fn new(public_key: [u8; KEY_SIZE]) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = bounded(QUEUE_PEER_INBOUND_SIZE);
        let (stop_tx, stop_rx) = bounded(0);

        Arc::new(Self {
            public_key,
            endpoint: Mutex::new(None),
            handshake: Mutex::new(Handshake::new(public_key)),
            cookie_generator: Mutex::new(CookieGenerator::new(&public_key)),
            keypairs: Mutex::new(KeyPairs::new()),
            timers: PeerTimers::new(),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            persistent_keepalive: AtomicU64::new(0),
            inbound_tx,
            inbound_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            thread: Mutex::new(None),
        })
    }

    /// Transmitted bytes (full datagrams)
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    /// Received bytes (inner packets delivered to the tunnel)
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Current endpoint, if any
    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock()
    }

    /// Stop the sequential receiver and wait for it to exit. Idempotent;
    /// must not be called from the receiver task itself.
    pub(crate) fn shutdown(&self) {
        self.stop_tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Abbreviated key for logs
    pub(crate) fn log_id(&self) -> String {
        format!(
            "peer({:02x}{:02x}{:02x}{:02x}…)",
            self.public_key[0], self.public_key[1], self.public_key[2], self.public_key[3]
        )
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.log_id())
            .field("endpoint", &*self.endpoint.lock())
            .finish_non_exhaustive()
    }
}
