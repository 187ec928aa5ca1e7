//! # Routing Table
//!
//! Longest-prefix map from inner IP addresses to peers: one trie per address
//! family. A peer's allowed-IP prefixes authorize it as the inner source of
//! inbound packets and select it as the destination for outbound ones.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use parking_lot::RwLock;

use crate::peer::Peer;

/// Longest-prefix routing table over peers
pub struct RoutingTable {
    table: RwLock<IpNetworkTable<Arc<Peer>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(IpNetworkTable::new()),
        }
    }

    /// Insert a prefix for a peer. A later insert over an existing prefix
    /// reassigns ownership.
    pub fn insert(&self, network: IpNetwork, peer: Arc<Peer>) {
        self.table.write().insert(network, peer);
    }

    /// Longest-prefix lookup for an IPv4 address
    pub fn lookup_v4(&self, addr: Ipv4Addr) -> Option<Arc<Peer>> {
        self.lookup(IpAddr::V4(addr))
    }

    /// Longest-prefix lookup for an IPv6 address
    pub fn lookup_v6(&self, addr: Ipv6Addr) -> Option<Arc<Peer>> {
        self.lookup(IpAddr::V6(addr))
    }

    /// Longest-prefix lookup
    pub fn lookup(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        self.table
            .read()
            .longest_match(addr)
            .map(|(_, peer)| Arc::clone(peer))
    }

    /// Remove every prefix owned by `peer`
    pub fn remove_peer(&self, peer: &Arc<Peer>) {
        let mut table = self.table.write();
        let owned: Vec<IpNetwork> = table
            .iter()
            .filter(|(_, p)| Arc::ptr_eq(p, peer))
            .map(|(network, _)| network)
            .collect();
        for network in owned {
            table.remove(network);
        }
    }

    /// All prefixes owned by `peer`, for configuration snapshots
    pub fn all_prefixes(&self, peer: &Arc<Peer>) -> Vec<IpNetwork> {
        self.table
            .read()
            .iter()
            .filter(|(_, p)| Arc::ptr_eq(p, peer))
            .map(|(network, _)| network)
            .collect()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an `address/prefix` string, truncating host bits
pub fn parse_cidr(value: &str) -> Option<IpNetwork> {
    let (addr, prefix) = value.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    IpNetwork::new_truncate(addr, prefix).ok()
}
