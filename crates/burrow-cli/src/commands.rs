//! # Commands
//!
//! Implementations behind the CLI subcommands.

use std::fs;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burrow_core::{Device, DeviceConfig};
use burrow_protocol::{derive_public, StaticKeys, KEY_SIZE};
use log::info;

use crate::config::Config;
use crate::tun_linux::LinuxTun;
use crate::uapi_listener;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Bring the tunnel up and run until SIGINT/SIGTERM
pub fn cmd_up(config_path: &str) -> CliResult {
    let config = Config::from_file(config_path)?;
    let iface = &config.interface;

    let tun = LinuxTun::create(&iface.name)?;
    if let Some(address) = &iface.address {
        let (addr, prefix) = parse_address(address)?;
        tun.set_address(addr, prefix)?;
    }
    tun.set_mtu(iface.mtu)?;
    tun.bring_up()?;
    info!("tunnel device {} ready (mtu {})", iface.name, iface.mtu);

    let device = Device::new(
        Arc::new(tun),
        DeviceConfig {
            decryption_workers: iface.decryption_workers,
        },
    );

    if let Some(path) = &iface.private_key_file {
        let raw = fs::read_to_string(path)?;
        let key = decode_hex_key(raw.trim())
            .ok_or_else(|| format!("{}: not a hex private key", path))?;
        device.set_private_key(Some(key));
    }
    if let Some(port) = iface.listen_port {
        device.set_listen_port(port)?;
    }

    device.up();

    let socket_path = config.control_socket();
    uapi_listener::spawn(Arc::clone(&device), &socket_path)?;
    info!("control socket at {}", socket_path.display());

    setup_signal_handler();
    while RUNNING.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    device.stop();
    let _ = fs::remove_file(&socket_path);
    Ok(())
}

/// Generate a private key and print it as hex
pub fn cmd_genkey() -> CliResult {
    let keys = StaticKeys::generate();
    println!("{}", encode_hex(keys.private()));
    Ok(())
}

/// Derive the public key of a hex private key read on stdin
pub fn cmd_pubkey() -> CliResult {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let private =
        decode_hex_key(input.trim()).ok_or("stdin does not contain a hex private key")?;
    println!("{}", encode_hex(&derive_public(&private)));
    Ok(())
}

/// Print the state of a running instance
pub fn cmd_show(config_path: &str) -> CliResult {
    let config = Config::from_file(config_path)?;
    let socket_path = config.control_socket();

    let mut stream = UnixStream::connect(&socket_path)?;
    stream.write_all(b"get=1\n\n")?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    print!("{}", reply);
    Ok(())
}

fn parse_address(value: &str) -> Result<(Ipv4Addr, u8), String> {
    let err = || format!("invalid interface address: {}", value);
    let (addr, prefix) = value.split_once('/').ok_or_else(err)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
    let prefix: u8 = prefix.parse().map_err(|_| err())?;
    if prefix > 32 {
        return Err(err());
    }
    Ok((addr, prefix))
}

fn setup_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn encode_hex(data: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(data.len() * 2);
    for byte in data {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    hex
}

fn decode_hex_key(s: &str) -> Option<[u8; KEY_SIZE]> {
    if s.len() != KEY_SIZE * 2 {
        return None;
    }
    let mut out = [0u8; KEY_SIZE];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let val = |c: u8| match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        };
        out[i] = (val(chunk[0])? << 4) | val(chunk[1])?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("10.0.0.1/24").unwrap(),
            ("10.0.0.1".parse().unwrap(), 24)
        );
        assert!(parse_address("10.0.0.1").is_err());
        assert!(parse_address("10.0.0.1/40").is_err());
        assert!(parse_address("host/24").is_err());
    }

    #[test]
    fn test_hex_key_roundtrip() {
        let keys = StaticKeys::generate();
        let hex = encode_hex(keys.private());
        assert_eq!(decode_hex_key(&hex), Some(*keys.private()));
        assert!(decode_hex_key("abc").is_none());
    }

    #[test]
    fn test_pubkey_matches_engine_derivation() {
        let keys = StaticKeys::generate();
        assert_eq!(derive_public(keys.private()), *keys.public());
    }
}
