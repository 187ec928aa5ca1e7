//! Shared test fixtures: a channel-backed tunnel device, a scripted control
//! stream, and packet builders.

use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::{uapi, Device, TunDevice};
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Tunnel device backed by channels: the test writes outbound IP packets
/// into `outbound_tx` and reads delivered inbound packets from `inbound_rx`
pub struct ChannelTun {
    outbound_rx: Receiver<Vec<u8>>,
    inbound_tx: Sender<Vec<u8>>,
}

pub struct TunHandle {
    pub outbound_tx: Sender<Vec<u8>>,
    pub inbound_rx: Receiver<Vec<u8>>,
}

pub fn channel_tun() -> (Arc<ChannelTun>, TunHandle) {
    let (outbound_tx, outbound_rx) = unbounded();
    let (inbound_tx, inbound_rx) = unbounded();
    (
        Arc::new(ChannelTun {
            outbound_rx,
            inbound_tx,
        }),
        TunHandle {
            outbound_tx,
            inbound_rx,
        },
    )
}

impl TunDevice for ChannelTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.outbound_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::WouldBlock, "no packet")),
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let _ = self.inbound_tx.send(packet.to_vec());
        Ok(packet.len())
    }

    fn is_up(&self) -> io::Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "test0"
    }
}

/// In-memory control connection carrying one scripted operation
pub struct TestStream {
    input: Cursor<Vec<u8>>,
    output: Vec<u8>,
}

impl Read for TestStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for TestStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run one control operation against a device, returning the full reply
pub fn control(device: &Arc<Device>, script: &str) -> String {
    let mut stream = TestStream {
        input: Cursor::new(script.as_bytes().to_vec()),
        output: Vec::new(),
    };
    uapi::handle(device, &mut stream);
    String::from_utf8(stream.output).expect("control replies are utf-8")
}

/// The errno line of a control reply
pub fn reply_errno(reply: &str) -> i32 {
    reply
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("errno="))
        .and_then(|code| code.parse().ok())
        .expect("control reply carries an errno line")
}

/// A field from a `get` reply, if present
pub fn reply_field<'a>(reply: &'a str, key: &str) -> Option<&'a str> {
    reply
        .lines()
        .find_map(|line| line.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

/// Minimal IPv4 packet with correct version, length and addresses
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut packet = vec![0u8; total];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    packet[8] = 64; // ttl
    packet[9] = 17; // udp
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());
    packet[20..].copy_from_slice(payload);
    packet
}

/// Poll until `check` passes or the timeout elapses
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

/// Hex of a 32-byte key, for control scripts
pub fn hex_key(key: &[u8; 32]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(64);
    for byte in key {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    hex
}
