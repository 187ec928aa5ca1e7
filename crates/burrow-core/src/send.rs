//! # Outbound Path
//!
//! A single reader pulls IP packets off the tunnel device, routes on the
//! inner destination and encrypts under the owning peer's active key-pair.
//! Outbound traffic with no usable key-pair triggers a handshake initiation
//! instead (spaced by the rekey timeout).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::device::Device;
use crate::peer::Peer;
use burrow_protocol::{
    TransportHeader, MAX_MESSAGE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE, REJECT_AFTER_MESSAGES,
};

impl Peer {
    /// Encrypt one inner packet (empty plaintext frames a keep-alive) and
    /// send it to the peer's endpoint. Returns false when the peer has no
    /// endpoint, no usable key-pair, or the socket write fails.
    pub(crate) fn send_transport(&self, device: &Device, plaintext: &[u8]) -> bool {
        let endpoint = match self.endpoint() {
            Some(endpoint) => endpoint,
            None => return false,
        };
        let keypair = match self.keypairs.lock().send_keypair() {
            Some(keypair) => keypair,
            None => return false,
        };
        if keypair.expired() {
            return false;
        }
        let counter = keypair.next_counter();
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }
        let sealed = match keypair.encrypt(counter, plaintext) {
            Some(sealed) => sealed,
            None => return false,
        };

        let header = TransportHeader {
            receiver_index: keypair.remote_index,
            counter,
        };
        let mut datagram = Vec::with_capacity(MESSAGE_TRANSPORT_HEADER_SIZE + sealed.len());
        datagram.extend_from_slice(&header.to_bytes());
        datagram.extend_from_slice(&sealed);

        match device.send_udp(&datagram, endpoint) {
            Ok(_) => {
                self.tx_bytes.fetch_add(datagram.len() as u64, Ordering::Relaxed);
                self.timer_any_authenticated_packet_traversal();
                true
            }
            Err(e) => {
                debug!("{} failed to send transport: {}", self.log_id(), e);
                false
            }
        }
    }

    /// Send an empty transport message
    pub(crate) fn send_keepalive(&self, device: &Device) -> bool {
        debug!("{} sending keep-alive", self.log_id());
        self.send_transport(device, &[])
    }
}

/// Create, MAC and send a handshake initiation to `peer`. No-op while a
/// recent initiation is still in flight (rekey-timeout spacing) or the peer
/// has no endpoint.
pub(crate) fn send_handshake_initiation(device: &Device, peer: &Arc<Peer>) {
    if !peer.may_initiate() {
        return;
    }
    let endpoint = match peer.endpoint() {
        Some(endpoint) => endpoint,
        None => {
            debug!("{} cannot initiate without an endpoint", peer.log_id());
            return;
        }
    };

    let keys_guard = device.static_keys.read();
    let keys = match keys_guard.as_ref() {
        Some(keys) => keys,
        None => return,
    };

    let message = {
        let mut handshake = peer.handshake.lock();
        let previous = handshake.local_index();
        let index = device.index.new_index(peer);
        if previous != 0 {
            // an abandoned handshake frees its id; a live key-pair keeps it
            device.index.remove_if_stale(previous);
        }
        handshake.set_local_index(index);
        match handshake.create_initiation(keys) {
            Ok(message) => message,
            Err(e) => {
                error!("{} failed to create initiation: {}", peer.log_id(), e);
                device.index.remove(index);
                return;
            }
        }
    };
    drop(keys_guard);

    *peer.timers.last_initiation_sent.lock() = Some(Instant::now());
    peer.timer_ephemeral_key_created();

    let mut bytes = message.to_bytes();
    peer.cookie_generator.lock().add_macs(&mut bytes);

    debug!("{} sending handshake initiation", peer.log_id());
    match device.send_udp(&bytes, endpoint) {
        Ok(_) => {
            peer.tx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            peer.timer_any_authenticated_packet_traversal();
        }
        Err(e) => debug!("{} failed to send initiation: {}", peer.log_id(), e),
    }
}

/// Tunnel reader task: route outbound packets to peers by inner destination
pub(crate) fn run_tun_reader(device: Arc<Device>) {
    debug!("routine: tunnel reader started");
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    while device.running.load(Ordering::Acquire) {
        let len = match device.tun.read(&mut buf) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if device.running.load(Ordering::Acquire) {
                    error!("tunnel read error: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
                continue;
            }
        };

        let packet = &buf[..len];
        let destination = match outbound_destination(packet) {
            Some(destination) => destination,
            None => {
                debug!("tunnel packet with invalid header");
                continue;
            }
        };

        let peer = match device.routing.lookup(destination) {
            Some(peer) => peer,
            None => {
                debug!("no peer routes {}", destination);
                continue;
            }
        };

        if !peer.send_transport(&device, packet) {
            // no usable key-pair yet: start (or re-drive) the handshake
            send_handshake_initiation(&device, &peer);
        }
    }
    debug!("routine: tunnel reader stopped");
}

fn outbound_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))),
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
