//! # Session Index
//!
//! Maps 32-bit receiver ids to the (peer, key-pair) that decrypts transport
//! packets carrying them. The hot-path lookup runs on every inbound
//! transport datagram and must not block decryption, so the map is a sharded
//! concurrent hash map holding non-owning backreferences; ownership stays
//! rooted at the device.
//!
//! An id is allocated when a handshake needs one (the entry then knows only
//! its peer) and gains its key-pair when the handshake completes. Entries
//! are removed when their key-pair is evicted from every slot.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand_core::{OsRng, RngCore};

use crate::keypair::KeyPair;
use crate::peer::Peer;

struct IndexEntry {
    peer: Weak<Peer>,
    keypair: Weak<KeyPair>,
}

/// Receiver-id → (peer, key-pair) map
pub struct SessionIndex {
    map: DashMap<u32, IndexEntry>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Allocate a fresh random id bound to `peer`. Retries on collision.
    pub fn new_index(&self, peer: &Arc<Peer>) -> u32 {
        loop {
            let id = OsRng.next_u32();
            match self.map.entry(id) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(IndexEntry {
                        peer: Arc::downgrade(peer),
                        keypair: Weak::new(),
                    });
                    return id;
                }
            }
        }
    }

    /// Attach the derived key-pair to a previously allocated id
    pub fn set_key_pair(&self, id: u32, keypair: &Arc<KeyPair>) {
        if let Some(mut entry) = self.map.get_mut(&id) {
            entry.keypair = Arc::downgrade(keypair);
        }
    }

    /// Hot-path lookup. Returns the live (peer, key-pair) or nothing.
    pub fn lookup(&self, id: u32) -> Option<(Arc<Peer>, Arc<KeyPair>)> {
        let entry = self.map.get(&id)?;
        let peer = entry.peer.upgrade()?;
        let keypair = entry.keypair.upgrade()?;
        Some((peer, keypair))
    }

    /// Remove an id outright
    pub fn remove(&self, id: u32) {
        self.map.remove(&id);
    }

    /// Remove an id only if no live key-pair hangs off it; used when a new
    /// handshake supersedes an abandoned one
    pub fn remove_if_stale(&self, id: u32) {
        self.map
            .remove_if(&id, |_, entry| entry.keypair.upgrade().is_none());
    }

    /// Number of live entries (tests and diagnostics)
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::SessionKeys;
    use zeroize::Zeroizing;

    fn keypair(local: u32) -> Arc<KeyPair> {
        Arc::new(KeyPair::new(SessionKeys {
            send: Zeroizing::new([1u8; 32]),
            receive: Zeroizing::new([2u8; 32]),
            local_index: local,
            remote_index: 0,
            is_initiator: false,
        }))
    }

    #[test]
    fn test_lookup_requires_keypair() {
        let index = SessionIndex::new();
        let peer = Peer::new([7u8; 32]);

        let id = index.new_index(&peer);
        // handshake in flight: no key-pair yet, transport lookups miss
        assert!(index.lookup(id).is_none());

        let kp = keypair(id);
        index.set_key_pair(id, &kp);
        let (found_peer, found_kp) = index.lookup(id).unwrap();
        assert!(Arc::ptr_eq(&found_peer, &peer));
        assert!(Arc::ptr_eq(&found_kp, &kp));
    }

    #[test]
    fn test_remove() {
        let index = SessionIndex::new();
        let peer = Peer::new([7u8; 32]);
        let id = index.new_index(&peer);
        let kp = keypair(id);
        index.set_key_pair(id, &kp);

        index.remove(id);
        assert!(index.lookup(id).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_dead_keypair_is_a_miss() {
        let index = SessionIndex::new();
        let peer = Peer::new([7u8; 32]);
        let id = index.new_index(&peer);
        {
            let kp = keypair(id);
            index.set_key_pair(id, &kp);
        }
        // key-pair dropped: entry is inert
        assert!(index.lookup(id).is_none());
    }

    #[test]
    fn test_remove_if_stale_spares_live_keypair() {
        let index = SessionIndex::new();
        let peer = Peer::new([7u8; 32]);

        let live_id = index.new_index(&peer);
        let kp = keypair(live_id);
        index.set_key_pair(live_id, &kp);

        let stale_id = index.new_index(&peer);

        index.remove_if_stale(live_id);
        index.remove_if_stale(stale_id);

        assert!(index.lookup(live_id).is_some());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_ids_are_distinct() {
        let index = SessionIndex::new();
        let peer = Peer::new([7u8; 32]);
        let a = index.new_index(&peer);
        let b = index.new_index(&peer);
        assert_ne!(a, b);
        assert_eq!(index.len(), 2);
    }
}
