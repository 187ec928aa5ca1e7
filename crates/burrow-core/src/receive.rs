//! # Receive Pipeline
//!
//! The staged inbound path. One demultiplexer classifies UDP datagrams and
//! leases buffers; a pool of workers decrypts out of order; a sequential
//! receiver per peer re-imposes order, rejects replays, promotes fresh
//! key-pairs and verifies the inner source; a single writer hands plaintext
//! to the tunnel device. The load monitor ticks once a second and flips the
//! `under_load` gate with hysteresis.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, RecvTimeoutError};
use log::{debug, error, info};

use crate::buffer::MessageBuffer;
use crate::device::Device;
use crate::peer::Peer;
use crate::queue::{
    send_drop_oldest, HandshakeElement, InboundElement, InboundState, QUEUE_HANDSHAKE_BUSY_SIZE,
};
use crate::timers;
use burrow_protocol::{
    MessageCookieReply, MessageType, MESSAGE_COOKIE_REPLY_SIZE, MESSAGE_INITIATION_SIZE,
    MESSAGE_RESPONSE_SIZE, MESSAGE_TRANSPORT_HEADER_SIZE, MESSAGE_TRANSPORT_OFFSET_CONTENT,
    MIN_MESSAGE_SIZE,
};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

// ═══════════════════════════════════════════════════════════════════════════
// LOAD MONITOR
// ═══════════════════════════════════════════════════════════════════════════

/// Hysteretic busy detector over the handshake queue depth.
///
/// Each one-second tick increments the sample count when the queue is deep,
/// decrements it (floor 0) otherwise, saturating at 30. The device is under
/// load while the count exceeds 5, so neither a single spike nor a single
/// quiet second flips the gate.
pub(crate) struct LoadTracker {
    samples: u32,
}

impl LoadTracker {
    pub(crate) fn new() -> Self {
        Self { samples: 0 }
    }

    pub(crate) fn tick(&mut self, handshake_queue_depth: usize) -> bool {
        if handshake_queue_depth > QUEUE_HANDSHAKE_BUSY_SIZE {
            self.samples = (self.samples + 1).min(30);
        } else if self.samples > 0 {
            self.samples -= 1;
        }
        self.samples > 5
    }
}

/// One-second housekeeping: under-load tracking, cookie secret rotation,
/// rate-limiter GC, persistent keep-alives
pub(crate) fn run_load_monitor(device: Arc<Device>) {
    debug!("routine: load monitor started");
    let ticker = tick(Duration::from_secs(1));
    let mut tracker = LoadTracker::new();

    loop {
        select! {
            recv(device.stop_rx) -> _ => break,
            recv(ticker) -> _ => {}
        }

        let busy = tracker.tick(device.queue_handshake_rx.len());
        device.under_load.store(busy, Ordering::Release);

        if let Some(checker) = device.cookie_checker.lock().as_mut() {
            checker.rotate_if_stale();
        }
        device.rate_limiter.gc();
        keepalive_sweep(&device);
    }
    debug!("routine: load monitor stopped");
}

fn keepalive_sweep(device: &Arc<Device>) {
    let peers: Vec<Arc<Peer>> = device.peers.read().values().cloned().collect();
    for peer in peers {
        let interval = peer.persistent_keepalive.load(Ordering::Relaxed);
        if interval == 0 || peer.endpoint().is_none() {
            continue;
        }
        let due = match *peer.timers.last_traversal.lock() {
            Some(at) => at.elapsed() >= Duration::from_secs(interval),
            None => true,
        };
        if due {
            peer.send_keepalive(device);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RECEIVE DEMULTIPLEXER
// ═══════════════════════════════════════════════════════════════════════════

/// Read datagrams off the UDP socket, classify by the 4-byte selector and
/// dispatch. The socket read carries a one-second deadline so stop is
/// observed promptly; a missing socket (being replaced by control) idles.
pub(crate) fn run_receiver(device: Arc<Device>) {
    debug!("routine: receive demultiplexer started");
    let mut pending: Option<MessageBuffer> = None;

    while device.running.load(Ordering::Acquire) {
        let socket = match device.socket.read().clone() {
            Some(socket) => socket,
            None => match device.stop_rx.recv_timeout(Duration::from_secs(1)) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            },
        };

        let mut buffer = pending.take().unwrap_or_else(|| device.pool.get());
        let (size, source) = match socket.recv_from(&mut buffer[..]) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                pending = Some(buffer);
                continue;
            }
            Err(e) => {
                if device.running.load(Ordering::Acquire) {
                    debug!("udp receive error: {}", e);
                }
                pending = Some(buffer);
                continue;
            }
        };

        if size < MIN_MESSAGE_SIZE {
            pending = Some(buffer);
            continue;
        }

        match MessageType::classify(&buffer[..size]) {
            Some(msg_type @ MessageType::Initiation) if size == MESSAGE_INITIATION_SIZE => {
                send_drop_oldest(
                    &device.queue_handshake_tx,
                    &device.queue_handshake_rx,
                    &device.pool,
                    HandshakeElement {
                        msg_type,
                        buffer,
                        len: size,
                        source,
                    },
                );
            }
            Some(msg_type @ MessageType::Response) if size == MESSAGE_RESPONSE_SIZE => {
                send_drop_oldest(
                    &device.queue_handshake_tx,
                    &device.queue_handshake_rx,
                    &device.pool,
                    HandshakeElement {
                        msg_type,
                        buffer,
                        len: size,
                        source,
                    },
                );
            }
            Some(MessageType::CookieReply) => {
                if size == MESSAGE_COOKIE_REPLY_SIZE {
                    if let Ok(reply) = MessageCookieReply::from_bytes(&buffer[..size]) {
                        consume_cookie_reply(&device, &reply);
                    }
                }
                pending = Some(buffer);
            }
            Some(MessageType::Transport) if size >= MESSAGE_TRANSPORT_HEADER_SIZE => {
                let receiver =
                    u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
                match device.index.lookup(receiver) {
                    Some((peer, keypair)) if !keypair.expired() => {
                        // the element rides both queues; the per-element
                        // latch sequences the worker and the receiver
                        let elem = InboundElement::new(keypair, buffer, size);
                        send_drop_oldest(
                            &device.queue_decryption_tx,
                            &device.queue_decryption_rx,
                            &device.pool,
                            Arc::clone(&elem),
                        );
                        send_drop_oldest(&peer.inbound_tx, &peer.inbound_rx, &device.pool, elem);
                    }
                    Some(_) => {
                        debug!("transport for expired key-pair {:#x}", receiver);
                        pending = Some(buffer);
                    }
                    None => {
                        debug!("transport for unknown receiver id {:#x}", receiver);
                        pending = Some(buffer);
                    }
                }
            }
            _ => {
                info!("unknown message from {}", source);
                pending = Some(buffer);
            }
        }
    }

    if let Some(buffer) = pending.take() {
        device.pool.put(buffer);
    }
    debug!("routine: receive demultiplexer stopped");
}

fn consume_cookie_reply(device: &Arc<Device>, reply: &MessageCookieReply) {
    match device.lookup_handshake_peer(reply.receiver_index) {
        Some(peer) => match peer.cookie_generator.lock().consume_reply(reply) {
            Ok(()) => debug!("{} installed cookie", peer.log_id()),
            Err(_) => debug!("{} discarded invalid cookie reply", peer.log_id()),
        },
        None => debug!(
            "cookie reply for unknown handshake {:#x}",
            reply.receiver_index
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DECRYPTION WORKERS
// ═══════════════════════════════════════════════════════════════════════════

/// Consume the decryption queue: extract the counter, AEAD-open in place,
/// and open the element's latch for the sequential receiver. Workers run in
/// parallel; ordering is not preserved here.
pub(crate) fn run_decryption(device: Arc<Device>) {
    debug!("routine: decryption worker started");
    loop {
        let elem = select! {
            recv(device.stop_rx) -> _ => break,
            recv(device.queue_decryption_rx) -> elem => match elem {
                Ok(elem) => elem,
                Err(_) => break,
            },
        };

        if elem.is_dropped() {
            elem.latch.open();
            continue;
        }

        {
            let mut state = elem.state.lock();
            let InboundState {
                buffer,
                start,
                end,
                counter,
            } = &mut *state;

            let opened = match buffer.as_mut() {
                Some(buf) => {
                    let packet = &mut buf[..*end];
                    let mut counter_bytes = [0u8; 8];
                    counter_bytes.copy_from_slice(&packet[8..16]);
                    *counter = u64::from_le_bytes(counter_bytes);

                    let content = &mut packet[MESSAGE_TRANSPORT_OFFSET_CONTENT..];
                    match elem.keypair.open_in_place(*counter, content) {
                        Ok(len) => {
                            *start = MESSAGE_TRANSPORT_OFFSET_CONTENT;
                            *end = MESSAGE_TRANSPORT_OFFSET_CONTENT + len;
                            true
                        }
                        Err(()) => false,
                    }
                }
                None => false,
            };

            if !opened {
                elem.drop_packet();
            }
        }
        elem.latch.open();
    }
    debug!("routine: decryption worker stopped");
}

// ═══════════════════════════════════════════════════════════════════════════
// PER-PEER SEQUENTIAL RECEIVER
// ═══════════════════════════════════════════════════════════════════════════

/// Consume one peer's inbound queue in order: await decryption, reject
/// replays, promote a fresh key-pair on its first accepted packet, verify
/// the inner source and forward to the tunnel writer.
pub(crate) fn run_peer_receiver(device: Arc<Device>, peer: Arc<Peer>) {
    debug!("routine: sequential receiver started for {}", peer.log_id());
    loop {
        let elem = select! {
            recv(device.stop_rx) -> _ => break,
            recv(peer.stop_rx) -> _ => break,
            recv(peer.inbound_rx) -> elem => match elem {
                Ok(elem) => elem,
                Err(_) => break,
            },
        };

        // wait for the decryption worker
        elem.latch.wait();

        if elem.is_dropped() {
            release(&device, &elem);
            continue;
        }

        let counter = elem.state.lock().counter;
        if !elem.keypair.replay_filter.lock().validate(counter) {
            debug!("{} rejected counter {}", peer.log_id(), counter);
            release(&device, &elem);
            continue;
        }

        peer.timer_any_authenticated_packet_traversal();
        peer.timer_any_authenticated_packet_received();
        timers::keep_key_fresh_receiving(&device, &peer);

        // first accepted packet under `next` confirms the handshake
        let promoted = {
            let mut keypairs = peer.keypairs.lock();
            if keypairs.is_next(&elem.keypair) {
                Some(keypairs.promote())
            } else {
                None
            }
        };
        if let Some(evicted) = promoted {
            if let Some(old) = evicted {
                device.index.remove(old.local_index);
            }
            peer.timer_handshake_complete();
            debug!("{} promoted fresh key-pair", peer.log_id());
        }

        let (start, end) = {
            let state = elem.state.lock();
            (state.start, state.end)
        };
        if start == end {
            debug!("{} keep-alive received", peer.log_id());
            release(&device, &elem);
            continue;
        }
        peer.timer_data_received();

        // validate the inner packet and truncate to its declared length
        let inner_source = {
            let mut state = elem.state.lock();
            let InboundState {
                buffer, start, end, ..
            } = &mut *state;
            match buffer.as_ref() {
                Some(buf) => match validate_inner(&buf[*start..*end]) {
                    Some((total, source)) => {
                        *end = *start + total;
                        Some(source)
                    }
                    None => None,
                },
                None => None,
            }
        };
        let inner_source = match inner_source {
            Some(source) => source,
            None => {
                debug!("{} invalid inner packet", peer.log_id());
                release(&device, &elem);
                continue;
            }
        };

        // the inner source must route back to the decrypting peer
        match device.routing.lookup(inner_source) {
            Some(owner) if Arc::ptr_eq(&owner, &peer) => {}
            _ => {
                info!(
                    "{} packet with unallowed inner source {}",
                    peer.log_id(),
                    inner_source
                );
                release(&device, &elem);
                continue;
            }
        }

        let len = {
            let state = elem.state.lock();
            state.end - state.start
        };
        peer.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);

        send_drop_oldest(
            &device.queue_inbound_tx,
            &device.queue_inbound_rx,
            &device.pool,
            elem,
        );
    }
    debug!("routine: sequential receiver stopped for {}", peer.log_id());
}

/// Parse the leading nibble and length field of a decrypted packet.
/// Returns the declared total length and the inner source address.
fn validate_inner(packet: &[u8]) -> Option<(usize, IpAddr)> {
    match packet[0] >> 4 {
        4 => {
            if packet.len() < IPV4_HEADER_LEN {
                return None;
            }
            let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
            if total < IPV4_HEADER_LEN || total > packet.len() {
                return None;
            }
            let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
            Some((total, IpAddr::V4(source)))
        }
        6 => {
            if packet.len() < IPV6_HEADER_LEN {
                return None;
            }
            let payload = u16::from_be_bytes([packet[4], packet[5]]) as usize;
            let total = IPV6_HEADER_LEN + payload;
            if total > packet.len() {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[8..24]);
            Some((total, IpAddr::V6(Ipv6Addr::from(octets))))
        }
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TUNNEL WRITER
// ═══════════════════════════════════════════════════════════════════════════

/// Single consumer of the device-wide inbound queue; tunnel interfaces are
/// not reentrant per descriptor, so all peers funnel through this one task
pub(crate) fn run_tun_writer(device: Arc<Device>) {
    debug!("routine: tunnel writer started");
    loop {
        let elem = select! {
            recv(device.stop_rx) -> _ => break,
            recv(device.queue_inbound_rx) -> elem => match elem {
                Ok(elem) => elem,
                Err(_) => break,
            },
        };

        if !elem.is_dropped() {
            let state = elem.state.lock();
            if let Some(buf) = state.buffer.as_ref() {
                if let Err(e) = device.tun.write(&buf[state.start..state.end]) {
                    error!("failed to write packet to tunnel device: {}", e);
                }
            }
        }
        release(&device, &elem);
    }
    debug!("routine: tunnel writer stopped");
}

fn release(device: &Device, elem: &InboundElement) {
    if let Some(buf) = elem.take_buffer() {
        device.pool.put(buf);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_tracker_hysteresis() {
        let mut tracker = LoadTracker::new();
        let deep = QUEUE_HANDSHAKE_BUSY_SIZE + 1;

        // a single busy tick must not flip the gate
        assert!(!tracker.tick(deep));
        assert!(!tracker.tick(0));

        // sustained pressure flips it after six busy ticks
        let mut tracker = LoadTracker::new();
        for i in 0..6 {
            let busy = tracker.tick(deep);
            assert_eq!(busy, i == 5, "tick {}", i);
        }

        // longer pressure builds headroom: one quiet second does not clear it
        for _ in 0..4 {
            tracker.tick(deep);
        }
        assert!(tracker.tick(0));

        // sustained relief clears it
        let mut cleared = false;
        for _ in 0..9 {
            cleared = !tracker.tick(0);
        }
        assert!(cleared);
    }

    #[test]
    fn test_load_tracker_saturates() {
        let mut tracker = LoadTracker::new();
        let deep = QUEUE_HANDSHAKE_BUSY_SIZE + 1;

        // far more busy ticks than the clamp
        for _ in 0..100 {
            tracker.tick(deep);
        }
        // the counter saturated at 30, so relief takes 25 ticks, not 95
        for _ in 0..24 {
            assert!(tracker.tick(0));
        }
        for _ in 0..6 {
            tracker.tick(0);
        }
        assert!(!tracker.tick(0));
    }

    #[test]
    fn test_validate_inner_ipv4() {
        // 20-byte header, total length 28, source 10.0.0.7
        let mut packet = vec![0u8; 40];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[12..16].copy_from_slice(&[10, 0, 0, 7]);

        let (total, source) = validate_inner(&packet).unwrap();
        assert_eq!(total, 28);
        assert_eq!(source, "10.0.0.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_validate_inner_ipv4_bad_lengths() {
        // declared length exceeds the buffer
        let mut packet = vec![0u8; 24];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&100u16.to_be_bytes());
        assert!(validate_inner(&packet).is_none());

        // declared length below the header minimum
        let mut packet = vec![0u8; 24];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&8u16.to_be_bytes());
        assert!(validate_inner(&packet).is_none());

        // truncated header
        let packet = [0x45u8; 12];
        assert!(validate_inner(&packet).is_none());
    }

    #[test]
    fn test_validate_inner_ipv6() {
        let mut packet = vec![0u8; 60];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&8u16.to_be_bytes());
        packet[8] = 0xfd;
        packet[23] = 0x01;

        let (total, source) = validate_inner(&packet).unwrap();
        assert_eq!(total, 48);
        assert_eq!(source, "fd00::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_validate_inner_bad_version() {
        let packet = [0x20u8; 40];
        assert!(validate_inner(&packet).is_none());
    }
}
