//! Control protocol tests: configuration round-trips, peer replacement and
//! the error taxonomy.

mod common;

use std::sync::Arc;

use burrow_core::{Device, DeviceConfig};
use burrow_protocol::StaticKeys;

use common::*;

fn quiet_device() -> (Arc<Device>, StaticKeys) {
    let keys = StaticKeys::generate();
    let (tun, _handle) = channel_tun();
    let device = Device::new(tun, DeviceConfig::default());
    (device, keys)
}

/// Everything written by `set` comes back from `get` (property 7)
#[test]
fn test_get_returns_what_set_wrote() {
    let (device, keys) = quiet_device();
    let peer_keys = StaticKeys::generate();
    let psk = [0x5Au8; 32];

    let script = format!(
        "set=1\n\
         private_key={}\n\
         listen_port=0\n\
         fwmark=51820\n\
         public_key={}\n\
         preshared_key={}\n\
         endpoint=192.0.2.5:51820\n\
         persistent_keepalive_interval=0\n\
         allowed_ip=10.0.0.0/24\n\
         allowed_ip=fd00::/64\n\
         \n",
        hex_key(keys.private()),
        hex_key(peer_keys.public()),
        hex_key(&psk),
    );
    let reply = control(&device, &script);
    assert_eq!(reply_errno(&reply), 0);

    let state = control(&device, "get=1\n");
    assert_eq!(reply_errno(&state), 0);
    assert_eq!(
        reply_field(&state, "private_key"),
        Some(hex_key(keys.private()).as_str())
    );
    assert_eq!(
        reply_field(&state, "public_key"),
        Some(hex_key(peer_keys.public()).as_str())
    );
    assert_eq!(
        reply_field(&state, "preshared_key"),
        Some(hex_key(&psk).as_str())
    );
    assert_eq!(reply_field(&state, "endpoint"), Some("192.0.2.5:51820"));
    assert_eq!(reply_field(&state, "last_handshake_time_sec"), Some("0"));
    assert_eq!(reply_field(&state, "last_handshake_time_nsec"), Some("0"));
    assert_eq!(reply_field(&state, "tx_bytes"), Some("0"));
    assert_eq!(reply_field(&state, "rx_bytes"), Some("0"));
    assert_eq!(
        reply_field(&state, "persistent_keepalive_interval"),
        Some("0")
    );
    assert!(state.contains("allowed_ip=10.0.0.0/24"));
    assert!(state.contains("allowed_ip=fd00::/64"));
}

/// `replace_peers=true` with no following stanzas empties the peer table
/// (scenario S5)
#[test]
fn test_replace_peers_empties_table() {
    let (device, keys) = quiet_device();
    let peer_keys = StaticKeys::generate();

    let script = format!(
        "set=1\nprivate_key={}\npublic_key={}\nallowed_ip=10.0.0.0/24\n\n",
        hex_key(keys.private()),
        hex_key(peer_keys.public()),
    );
    assert_eq!(reply_errno(&control(&device, &script)), 0);
    assert_eq!(device.peer_count(), 1);

    let reply = control(&device, "set=1\nreplace_peers=true\n\n");
    assert_eq!(reply_errno(&reply), 0);
    assert_eq!(device.peer_count(), 0);

    let state = control(&device, "get=1\n");
    assert!(state.contains("private_key="));
    assert!(state.contains("listen_port="));
    assert!(!state.contains("public_key="));
    assert!(!state.contains("allowed_ip="));
}

#[test]
fn test_replace_allowed_ips() {
    let (device, keys) = quiet_device();
    let peer_keys = StaticKeys::generate();

    let script = format!(
        "set=1\nprivate_key={}\npublic_key={}\nallowed_ip=10.0.0.0/24\nallowed_ip=10.1.0.0/24\n\n",
        hex_key(keys.private()),
        hex_key(peer_keys.public()),
    );
    assert_eq!(reply_errno(&control(&device, &script)), 0);

    let script = format!(
        "set=1\npublic_key={}\nreplace_allowed_ips=true\nallowed_ip=192.168.0.0/16\n\n",
        hex_key(peer_keys.public()),
    );
    assert_eq!(reply_errno(&control(&device, &script)), 0);

    let state = control(&device, "get=1\n");
    assert!(!state.contains("allowed_ip=10.0.0.0/24"));
    assert!(!state.contains("allowed_ip=10.1.0.0/24"));
    assert!(state.contains("allowed_ip=192.168.0.0/16"));
}

#[test]
fn test_remove_peer() {
    let (device, keys) = quiet_device();
    let peer_keys = StaticKeys::generate();

    let script = format!(
        "set=1\nprivate_key={}\npublic_key={}\n\n",
        hex_key(keys.private()),
        hex_key(peer_keys.public()),
    );
    assert_eq!(reply_errno(&control(&device, &script)), 0);

    let script = format!(
        "set=1\npublic_key={}\nremove=true\n\n",
        hex_key(peer_keys.public()),
    );
    assert_eq!(reply_errno(&control(&device, &script)), 0);
    assert_eq!(device.peer_count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TAXONOMY
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_malformed_line_is_protocol_error() {
    let (device, _) = quiet_device();
    let reply = control(&device, "set=1\nbanana\n\n");
    assert_eq!(reply_errno(&reply), 71);
}

#[test]
fn test_invalid_values_are_rejected() {
    let (device, keys) = quiet_device();
    device.set_private_key(Some(*keys.private()));

    for script in [
        "set=1\nlisten_port=notaport\n\n".to_string(),
        "set=1\nprivate_key=deadbeef\n\n".to_string(),
        "set=1\nreplace_peers=false\n\n".to_string(),
        "set=1\nfrobnicate=1\n\n".to_string(),
        format!(
            "set=1\npublic_key={}\nendpoint=nowhere\n\n",
            hex_key(StaticKeys::generate().public())
        ),
        format!(
            "set=1\npublic_key={}\nallowed_ip=10.0.0.0\n\n",
            hex_key(StaticKeys::generate().public())
        ),
    ] {
        let reply = control(&device, &script);
        assert_eq!(reply_errno(&reply), 22, "script {:?}", script);
    }
}

#[test]
fn test_peer_key_equal_to_device_rejected() {
    let (device, keys) = quiet_device();
    device.set_private_key(Some(*keys.private()));

    let reply = control(
        &device,
        &format!("set=1\npublic_key={}\n\n", hex_key(keys.public())),
    );
    assert_eq!(reply_errno(&reply), 22);
    assert_eq!(device.peer_count(), 0);
}

/// A peer-scoped line right after `remove=true` has no peer to apply to and
/// must fail cleanly
#[test]
fn test_peer_key_after_remove_errors_cleanly() {
    let (device, keys) = quiet_device();
    let peer_keys = StaticKeys::generate();

    let script = format!(
        "set=1\nprivate_key={}\npublic_key={}\nremove=true\nallowed_ip=10.0.0.0/24\n\n",
        hex_key(keys.private()),
        hex_key(peer_keys.public()),
    );
    let reply = control(&device, &script);
    assert_eq!(reply_errno(&reply), 22);
}

/// Earlier lines of a failed `set` stay applied (no rollback)
#[test]
fn test_partial_set_is_not_rolled_back() {
    let (device, keys) = quiet_device();

    let script = format!(
        "set=1\nprivate_key={}\nbanana\n\n",
        hex_key(keys.private())
    );
    let reply = control(&device, &script);
    assert_eq!(reply_errno(&reply), 71);

    // the private key line before the failure took effect
    assert_eq!(device.public_key(), Some(*keys.public()));
}

#[test]
fn test_unknown_operation_ignored() {
    let (device, _) = quiet_device();
    let reply = control(&device, "frobnicate=1\n");
    assert!(reply.is_empty());
}
