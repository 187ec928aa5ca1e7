//! # Control Protocol
//!
//! Line-framed text configuration over any reliable byte stream the host
//! supplies. One operation per connection: `get=1` serialises device and
//! peer state, `set=1` applies `key=value` lines (device-scoped until the
//! first `public_key`, peer-scoped after). The reply is `errno=<code>`
//! followed by a blank line; partial changes from a failed `set` are left
//! in place.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error};

use crate::device::Device;
use crate::peer::Peer;
use crate::routing::parse_cidr;
use burrow_protocol::KEY_SIZE;

/// Transport failure while serving the operation
pub const ERRNO_IO: i32 = 5;
/// Syntactically malformed line
pub const ERRNO_PROTOCOL: i32 = 71;
/// Well-formed but rejected value
pub const ERRNO_INVALID: i32 = 22;

/// Serve one control connection
pub fn handle<S: Read + Write>(device: &Arc<Device>, stream: &mut S) {
    let mut reader = BufReader::new(&mut *stream);
    let mut op = String::new();
    if reader.read_line(&mut op).is_err() {
        return;
    }

    match op.as_str() {
        "get=1\n" => {
            debug!("control: get operation");
            let lines = get_operation(device);
            drop(reader);
            let mut status = 0;
            for line in &lines {
                if writeln!(stream, "{}", line).is_err() {
                    status = ERRNO_IO;
                    break;
                }
            }
            let _ = write!(stream, "errno={}\n\n", status);
        }
        "set=1\n" => {
            debug!("control: set operation");
            let status = set_operation(device, &mut reader);
            drop(reader);
            let _ = write!(stream, "errno={}\n\n", status);
        }
        _ => error!("invalid control operation: {:?}", op.trim_end()),
    }
    let _ = stream.flush();
}

// ═══════════════════════════════════════════════════════════════════════════
// GET
// ═══════════════════════════════════════════════════════════════════════════

fn get_operation(device: &Arc<Device>) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(keys) = device.static_keys.read().as_ref() {
        lines.push(format!("private_key={}", hex_encode(keys.private())));
    }
    lines.push(format!("listen_port={}", device.listen_port()));

    let peers = device.peers.read();
    for peer in peers.values() {
        lines.push(format!("public_key={}", hex_encode(&peer.public_key)));
        lines.push(format!(
            "preshared_key={}",
            hex_encode(&peer.handshake.lock().preshared_key())
        ));
        if let Some(endpoint) = peer.endpoint() {
            lines.push(format!("endpoint={}", endpoint));
        }

        let (sec, nsec) = peer.timers.last_handshake_time();
        lines.push(format!("last_handshake_time_sec={}", sec));
        lines.push(format!("last_handshake_time_nsec={}", nsec));
        lines.push(format!("tx_bytes={}", peer.tx_bytes()));
        lines.push(format!("rx_bytes={}", peer.rx_bytes()));
        lines.push(format!(
            "persistent_keepalive_interval={}",
            peer.persistent_keepalive.load(Ordering::Relaxed)
        ));

        for network in device.routing.all_prefixes(peer) {
            lines.push(format!("allowed_ip={}", network));
        }
    }

    lines
}

// ═══════════════════════════════════════════════════════════════════════════
// SET
// ═══════════════════════════════════════════════════════════════════════════

fn set_operation<R: BufRead>(device: &Arc<Device>, reader: &mut R) -> i32 {
    let mut peer: Option<Arc<Peer>> = None;
    let mut device_scope = true;

    loop {
        let mut raw = String::new();
        match reader.read_line(&mut raw) {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(_) => return ERRNO_IO,
        }

        let line = raw.trim_end_matches(|c| c == '\r' || c == '\n');
        if line.is_empty() {
            return 0;
        }

        let (key, value) = match line.split_once('=') {
            Some(pair) => pair,
            None => {
                error!("malformed control line: {:?}", line);
                return ERRNO_PROTOCOL;
            }
        };

        if key == "public_key" {
            device_scope = false;
            let public_key = match hex_decode_key(value) {
                Some(pk) => pk,
                None => {
                    error!("failed to parse peer public_key");
                    return ERRNO_INVALID;
                }
            };
            if device.public_key() == Some(public_key) {
                error!("peer public key matches the device's own");
                return ERRNO_INVALID;
            }
            peer = Some(match device.find_peer(&public_key) {
                Some(existing) => existing,
                None => device.new_peer(public_key),
            });
            continue;
        }

        let status = if device_scope {
            set_device_key(device, key, value)
        } else {
            set_peer_key(device, &mut peer, key, value)
        };
        if status != 0 {
            return status;
        }
    }
}

fn set_device_key(device: &Arc<Device>, key: &str, value: &str) -> i32 {
    match key {
        "private_key" => {
            if value.is_empty() {
                device.set_private_key(None);
                return 0;
            }
            match hex_decode_key(value) {
                Some(private) => {
                    device.set_private_key(Some(private));
                    0
                }
                None => {
                    error!("failed to parse private_key");
                    ERRNO_INVALID
                }
            }
        }
        "listen_port" => match value.parse::<u16>() {
            Ok(port) => match device.set_listen_port(port) {
                Ok(_) => 0,
                Err(e) => {
                    error!("failed to bind listen port: {}", e);
                    ERRNO_IO
                }
            },
            Err(_) => {
                error!("failed to parse listen_port");
                ERRNO_INVALID
            }
        },
        "fwmark" => match value.parse::<u32>() {
            Ok(mark) => {
                // recorded for `get`; socket marking is host business
                device.fwmark.store(mark, Ordering::Relaxed);
                0
            }
            Err(_) => {
                error!("failed to parse fwmark");
                ERRNO_INVALID
            }
        },
        "replace_peers" => {
            if value != "true" {
                error!("invalid replace_peers value: {}", value);
                return ERRNO_INVALID;
            }
            device.remove_all_peers();
            0
        }
        _ => {
            error!("invalid control key (device scope): {}", key);
            ERRNO_INVALID
        }
    }
}

fn set_peer_key(
    device: &Arc<Device>,
    peer_slot: &mut Option<Arc<Peer>>,
    key: &str,
    value: &str,
) -> i32 {
    let peer = match peer_slot.as_ref() {
        Some(peer) => Arc::clone(peer),
        None => {
            error!("peer-scoped key with no peer selected: {}", key);
            return ERRNO_INVALID;
        }
    };

    match key {
        "remove" => {
            if value != "true" {
                error!("invalid remove value: {}", value);
                return ERRNO_INVALID;
            }
            device.remove_peer(&peer.public_key);
            *peer_slot = None;
            0
        }
        "preshared_key" => match hex_decode_key(value) {
            Some(psk) => {
                peer.handshake.lock().set_preshared_key(psk);
                0
            }
            None => {
                error!("failed to parse preshared_key");
                ERRNO_INVALID
            }
        },
        "endpoint" => match value.parse::<SocketAddr>() {
            Ok(endpoint) => {
                *peer.endpoint.lock() = Some(endpoint);
                0
            }
            Err(_) => {
                error!("failed to parse endpoint: {}", value);
                ERRNO_INVALID
            }
        },
        "persistent_keepalive_interval" => match value.parse::<u16>() {
            Ok(secs) => {
                let old = peer
                    .persistent_keepalive
                    .swap(secs as u64, Ordering::Relaxed);

                // enabling keep-alives on a live tunnel sends one now
                if old == 0 && secs != 0 {
                    match device.tun.is_up() {
                        Ok(true) => {
                            peer.send_keepalive(device);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!("failed to query tunnel device state: {}", e);
                            return ERRNO_IO;
                        }
                    }
                }
                0
            }
            Err(_) => {
                error!("failed to parse persistent_keepalive_interval");
                ERRNO_INVALID
            }
        },
        "replace_allowed_ips" => {
            if value != "true" {
                error!("invalid replace_allowed_ips value: {}", value);
                return ERRNO_INVALID;
            }
            device.routing.remove_peer(&peer);
            0
        }
        "allowed_ip" => match parse_cidr(value) {
            Some(network) => {
                device.routing.insert(network, peer);
                0
            }
            None => {
                error!("failed to parse allowed_ip: {}", value);
                ERRNO_INVALID
            }
        },
        _ => {
            error!("invalid control key (peer scope): {}", key);
            ERRNO_INVALID
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HEX
// ═══════════════════════════════════════════════════════════════════════════

fn hex_encode(data: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(data.len() * 2);
    for byte in data {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    hex
}

fn hex_decode_key(s: &str) -> Option<[u8; KEY_SIZE]> {
    if s.len() != KEY_SIZE * 2 {
        return None;
    }
    let mut out = [0u8; KEY_SIZE];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        out[i] = (hex_val(chunk[0])? << 4) | hex_val(chunk[1])?;
    }
    Some(out)
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = [0xAB; KEY_SIZE];
        let encoded = hex_encode(&key);
        assert_eq!(encoded.len(), 64);
        assert_eq!(hex_decode_key(&encoded), Some(key));
    }

    #[test]
    fn test_hex_decode_rejects_garbage() {
        assert!(hex_decode_key("").is_none());
        assert!(hex_decode_key("abcd").is_none());
        assert!(hex_decode_key(&"zz".repeat(KEY_SIZE)).is_none());
    }

    #[test]
    fn test_hex_decode_mixed_case() {
        let upper = "AB".repeat(KEY_SIZE);
        assert_eq!(hex_decode_key(&upper), Some([0xAB; KEY_SIZE]));
    }
}
