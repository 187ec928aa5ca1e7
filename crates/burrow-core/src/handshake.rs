//! # Handshake Pump
//!
//! Single consumer of the handshake queue. Every element passes the MAC1
//! gate; under load it must additionally carry a valid MAC2 (or be answered
//! with a cookie reply) and survive the per-source rate limiter. Surviving
//! initiations and responses drive the Noise handshake and install fresh
//! key-pairs into the owning peer's `next` slot.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::select;
use log::{debug, error, info};

use crate::device::Device;
use crate::queue::HandshakeElement;
use burrow_protocol::{
    consume_initiation, MessageInitiation, MessageResponse, MessageType,
};

pub(crate) fn run_handshake(device: Arc<Device>) {
    debug!("routine: handshake pump started");
    loop {
        let elem = select! {
            recv(device.stop_rx) -> _ => break,
            recv(device.queue_handshake_rx) -> elem => match elem {
                Ok(elem) => elem,
                Err(_) => break,
            },
        };

        let HandshakeElement {
            msg_type,
            buffer,
            len,
            source,
        } = elem;
        handle_packet(&device, msg_type, &buffer[..len], source);
        device.pool.put(buffer);
    }
    debug!("routine: handshake pump stopped");
}

fn handle_packet(device: &Arc<Device>, msg_type: MessageType, packet: &[u8], source: SocketAddr) {
    let busy = device.under_load.load(Ordering::Acquire);

    {
        let mut checker_guard = device.cookie_checker.lock();
        let checker = match checker_guard.as_mut() {
            // no identity configured: nothing can authenticate
            None => return,
            Some(checker) => checker,
        };

        if !checker.check_mac1(packet) {
            debug!("packet with invalid mac1 from {}", source);
            return;
        }

        if busy && !checker.check_mac2(packet, &source) {
            // "sender" always follows "type"
            let sender = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
            match checker.create_cookie_reply(packet, sender, &source) {
                Ok(reply) => {
                    drop(checker_guard);
                    if let Err(e) = device.send_udp(&reply.to_bytes(), source) {
                        debug!("failed to send cookie reply: {}", e);
                    }
                }
                Err(e) => error!("failed to create cookie reply: {}", e),
            }
            return;
        }
    }

    if busy && !device.rate_limiter.allow(source.ip()) {
        debug!("rate-limited handshake from {}", source);
        return;
    }

    match msg_type {
        MessageType::Initiation => handle_initiation(device, packet, source),
        MessageType::Response => handle_response(device, packet, source),
        _ => error!("invalid message type in handshake queue"),
    }
}

fn handle_initiation(device: &Arc<Device>, packet: &[u8], source: SocketAddr) {
    let message = match MessageInitiation::from_bytes(packet) {
        Ok(message) => message,
        Err(e) => {
            debug!("malformed initiation from {}: {}", source, e);
            return;
        }
    };

    let keys_guard = device.static_keys.read();
    let keys = match keys_guard.as_ref() {
        Some(keys) => keys,
        None => return,
    };

    let incoming = match consume_initiation(keys, &message) {
        Ok(incoming) => incoming,
        Err(_) => {
            info!("invalid initiation message from {}", source);
            return;
        }
    };

    let peer = match device.find_peer(&incoming.remote_static) {
        Some(peer) => peer,
        None => {
            info!("initiation from unconfigured peer at {}", source);
            return;
        }
    };

    let created = {
        let mut handshake = peer.handshake.lock();
        if let Err(e) = handshake.apply_initiation(incoming) {
            debug!("{} rejected initiation: {}", peer.log_id(), e);
            return;
        }

        peer.timer_any_authenticated_packet_traversal();
        peer.timer_any_authenticated_packet_received();

        // the authenticated source becomes the peer's endpoint
        *peer.endpoint.lock() = Some(source);

        let previous = handshake.local_index();
        let index = device.index.new_index(&peer);
        if previous != 0 {
            device.index.remove_if_stale(previous);
        }
        handshake.set_local_index(index);

        match handshake.create_response(keys) {
            Ok((response, session)) => {
                peer.timer_ephemeral_key_created();
                Some((response, session))
            }
            Err(e) => {
                error!("{} failed to create response: {}", peer.log_id(), e);
                device.index.remove(index);
                None
            }
        }
    };
    drop(keys_guard);

    let (response, session) = match created {
        Some(created) => created,
        None => return,
    };

    device.install_key_pair(&peer, session);

    let mut bytes = response.to_bytes();
    peer.cookie_generator.lock().add_macs(&mut bytes);

    debug!("{} sending handshake response", peer.log_id());
    match device.send_udp(&bytes, source) {
        Ok(_) => {
            peer.tx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            peer.timer_any_authenticated_packet_traversal();
        }
        Err(e) => debug!("{} failed to send response: {}", peer.log_id(), e),
    }
}

fn handle_response(device: &Arc<Device>, packet: &[u8], source: SocketAddr) {
    let message = match MessageResponse::from_bytes(packet) {
        Ok(message) => message,
        Err(e) => {
            debug!("malformed response from {}: {}", source, e);
            return;
        }
    };

    let keys_guard = device.static_keys.read();
    let keys = match keys_guard.as_ref() {
        Some(keys) => keys,
        None => return,
    };

    let peer = match device.lookup_handshake_peer(message.receiver_index) {
        Some(peer) => peer,
        None => {
            info!("response for unknown handshake from {}", source);
            return;
        }
    };

    let session = {
        let mut handshake = peer.handshake.lock();
        match handshake.consume_response(keys, &message) {
            Ok(session) => session,
            Err(_) => {
                info!("invalid response message from {}", source);
                return;
            }
        }
    };
    drop(keys_guard);

    peer.timer_any_authenticated_packet_traversal();
    peer.timer_any_authenticated_packet_received();
    peer.timer_handshake_complete();

    device.install_key_pair(&peer, session);

    // confirm the fresh key-pair towards the responder
    peer.send_keepalive(device);
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
