//! # Peer Timers
//!
//! The timer hooks the data plane drives. The hooks record instants; the
//! only active policies here are keep-key-fresh (re-initiate when the
//! receiving key-pair nears its rejection deadline) and the persistent
//! keep-alive sweep in the housekeeping tick.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::device::Device;
use crate::peer::Peer;
use crate::send::send_handshake_initiation;
use burrow_protocol::{KEEPALIVE_TIMEOUT_SECS, REJECT_AFTER_TIME_SECS, REKEY_TIMEOUT_SECS};

/// Timer state recorded per peer
pub struct PeerTimers {
    /// Wall-clock time of the last completed handshake, reported by `get`
    pub(crate) last_handshake: Mutex<Option<Duration>>,
    /// Any authenticated packet sent or received
    pub(crate) last_traversal: Mutex<Option<Instant>>,
    /// Any authenticated packet received
    pub(crate) last_received: Mutex<Option<Instant>>,
    /// Decrypted data (not keep-alive) received
    pub(crate) last_data_received: Mutex<Option<Instant>>,
    /// Last handshake initiation sent; rate-limits re-initiation
    pub(crate) last_initiation_sent: Mutex<Option<Instant>>,
    /// Last ephemeral key created
    pub(crate) ephemeral_created: Mutex<Option<Instant>>,
}

impl PeerTimers {
    pub fn new() -> Self {
        Self {
            last_handshake: Mutex::new(None),
            last_traversal: Mutex::new(None),
            last_received: Mutex::new(None),
            last_data_received: Mutex::new(None),
            last_initiation_sent: Mutex::new(None),
            ephemeral_created: Mutex::new(None),
        }
    }

    /// Last handshake time as (seconds, nanoseconds) since the epoch
    pub fn last_handshake_time(&self) -> (u64, u32) {
        match *self.last_handshake.lock() {
            Some(d) => (d.as_secs(), d.subsec_nanos()),
            None => (0, 0),
        }
    }
}

impl Default for PeerTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl Peer {
    pub(crate) fn timer_any_authenticated_packet_traversal(&self) {
        *self.timers.last_traversal.lock() = Some(Instant::now());
    }

    pub(crate) fn timer_any_authenticated_packet_received(&self) {
        *self.timers.last_received.lock() = Some(Instant::now());
    }

    /// Handshake confirmed; stamps the wall-clock time `get` reports
    pub(crate) fn timer_handshake_complete(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        *self.timers.last_handshake.lock() = Some(now);
    }

    pub(crate) fn timer_ephemeral_key_created(&self) {
        *self.timers.ephemeral_created.lock() = Some(Instant::now());
    }

    pub(crate) fn timer_data_received(&self) {
        *self.timers.last_data_received.lock() = Some(Instant::now());
    }

    /// Whether a new initiation may be sent (REKEY_TIMEOUT spacing)
    pub(crate) fn may_initiate(&self) -> bool {
        match *self.timers.last_initiation_sent.lock() {
            Some(at) => at.elapsed() >= Duration::from_secs(REKEY_TIMEOUT_SECS),
            None => true,
        }
    }
}

/// Re-initiate before the receiving key-pair ages out. Only the initiator
/// rekeys on the receive path; the responder waits for the initiator's
/// fresh handshake.
pub(crate) fn keep_key_fresh_receiving(device: &Device, peer: &std::sync::Arc<Peer>) {
    let wants_rekey = {
        let keypairs = peer.keypairs.lock();
        match &keypairs.current {
            Some(kp) => {
                kp.is_initiator
                    && kp.created.elapsed()
                        >= Duration::from_secs(
                            REJECT_AFTER_TIME_SECS - KEEPALIVE_TIMEOUT_SECS - REKEY_TIMEOUT_SECS,
                        )
            }
            None => false,
        }
    };
    if wants_rekey {
        send_handshake_initiation(device, peer);
    }
}
