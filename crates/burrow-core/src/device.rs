//! # Device
//!
//! The root of the engine: static identity, peer table, routing table,
//! session index, rate limiter, buffer pool, the bounded queues between
//! stages, and the long-lived tasks that run them. Everything else holds
//! non-owning handles back to structures owned here.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::buffer::BufferPool;
use crate::handshake as pump;
use crate::index::SessionIndex;
use crate::keypair::KeyPair;
use crate::peer::Peer;
use crate::queue::{
    Evict, HandshakeElement, InboundElement, QUEUE_DECRYPTION_SIZE, QUEUE_HANDSHAKE_SIZE,
    QUEUE_INBOUND_SIZE,
};
use crate::ratelimit::RateLimiter;
use crate::receive;
use crate::routing::RoutingTable;
use crate::send;
use crate::tun::TunDevice;
use burrow_protocol::{CookieChecker, SessionKeys, StaticKeys, KEY_SIZE};

/// Tunables for a device
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Parallel decryption workers; 0 picks a value from the host's
    /// available parallelism
    pub decryption_workers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            decryption_workers: 0,
        }
    }
}

/// The engine root. Create with [`Device::new`], start the tasks with
/// [`Device::up`], tear down with [`Device::stop`].
pub struct Device {
    pub(crate) static_keys: RwLock<Option<StaticKeys>>,
    pub(crate) cookie_checker: Mutex<Option<CookieChecker>>,
    pub(crate) peers: RwLock<HashMap<[u8; KEY_SIZE], Arc<Peer>>>,
    pub(crate) routing: RoutingTable,
    pub(crate) index: SessionIndex,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) pool: BufferPool,

    pub(crate) socket: RwLock<Option<Arc<UdpSocket>>>,
    pub(crate) listen_port: Mutex<u16>,
    pub(crate) fwmark: AtomicU32,
    pub(crate) tun: Arc<dyn TunDevice>,

    pub(crate) queue_handshake_tx: Sender<HandshakeElement>,
    pub(crate) queue_handshake_rx: Receiver<HandshakeElement>,
    pub(crate) queue_decryption_tx: Sender<Arc<InboundElement>>,
    pub(crate) queue_decryption_rx: Receiver<Arc<InboundElement>>,
    pub(crate) queue_inbound_tx: Sender<Arc<InboundElement>>,
    pub(crate) queue_inbound_rx: Receiver<Arc<InboundElement>>,

    pub(crate) under_load: AtomicBool,
    pub(crate) running: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    pub(crate) stop_rx: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: DeviceConfig,
}

impl Device {
    /// Create a device around a tunnel interface. No tasks run until
    /// [`Device::up`]; no socket exists until a listen port is set.
    pub fn new(tun: Arc<dyn TunDevice>, config: DeviceConfig) -> Arc<Self> {
        let (queue_handshake_tx, queue_handshake_rx) = bounded(QUEUE_HANDSHAKE_SIZE);
        let (queue_decryption_tx, queue_decryption_rx) = bounded(QUEUE_DECRYPTION_SIZE);
        let (queue_inbound_tx, queue_inbound_rx) = bounded(QUEUE_INBOUND_SIZE);
        let (stop_tx, stop_rx) = bounded(0);

        Arc::new(Self {
            static_keys: RwLock::new(None),
            cookie_checker: Mutex::new(None),
            peers: RwLock::new(HashMap::new()),
            routing: RoutingTable::new(),
            index: SessionIndex::new(),
            rate_limiter: RateLimiter::new(),
            pool: BufferPool::new(),
            socket: RwLock::new(None),
            listen_port: Mutex::new(0),
            fwmark: AtomicU32::new(0),
            tun,
            queue_handshake_tx,
            queue_handshake_rx,
            queue_decryption_tx,
            queue_decryption_rx,
            queue_inbound_tx,
            queue_inbound_rx,
            under_load: AtomicBool::new(false),
            running: AtomicBool::new(true),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            threads: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Spawn the long-lived tasks: receive demultiplexer, decryption
    /// workers, handshake pump, tunnel writer, tunnel reader, load monitor
    pub fn up(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }

        let workers = match self.config.decryption_workers {
            0 => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .min(8),
            n => n,
        };

        threads.push(self.spawn(receive::run_receiver));
        for _ in 0..workers {
            threads.push(self.spawn(receive::run_decryption));
        }
        threads.push(self.spawn(pump::run_handshake));
        threads.push(self.spawn(receive::run_tun_writer));
        threads.push(self.spawn(send::run_tun_reader));
        threads.push(self.spawn(receive::run_load_monitor));

        info!("device up ({} decryption workers)", workers);
    }

    fn spawn(self: &Arc<Self>, f: fn(Arc<Device>)) -> JoinHandle<()> {
        let device = Arc::clone(self);
        thread::spawn(move || f(device))
    }

    /// Broadcast stop and wait for every task to exit. The device cannot be
    /// restarted afterwards.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_tx.lock().take();

        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }

        // recycle in-flight buffers; evicting inbound elements also opens
        // their latches so no sequential receiver stays parked on one
        while let Ok(elem) = self.queue_decryption_rx.try_recv() {
            elem.evict(&self.pool);
        }
        while let Ok(elem) = self.queue_inbound_rx.try_recv() {
            elem.evict(&self.pool);
        }
        while let Ok(elem) = self.queue_handshake_rx.try_recv() {
            elem.evict(&self.pool);
        }

        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            peer.shutdown();
            while let Ok(elem) = peer.inbound_rx.try_recv() {
                elem.evict(&self.pool);
            }
        }

        *self.socket.write() = None;
        info!("device stopped");
    }

    // ═══════════════════════════════════════════════════════════════════
    // IDENTITY AND SOCKET
    // ═══════════════════════════════════════════════════════════════════

    /// Install or clear the static private key. Rebuilds the cookie state
    /// and invalidates every in-flight handshake.
    pub fn set_private_key(&self, key: Option<[u8; KEY_SIZE]>) {
        {
            let mut keys = self.static_keys.write();
            let mut checker = self.cookie_checker.lock();
            match key {
                Some(private) => {
                    let keys_new = StaticKeys::from_private(private);
                    *checker = Some(CookieChecker::new(keys_new.public()));
                    *keys = Some(keys_new);
                }
                None => {
                    *keys = None;
                    *checker = None;
                }
            }
        }

        // sessions derived under the old identity die with it
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            for keypair in peer.keypairs.lock().clear() {
                self.index.remove(keypair.local_index);
            }
            let mut handshake = peer.handshake.lock();
            let index = handshake.local_index();
            if index != 0 {
                self.index.remove_if_stale(index);
            }
            handshake.clear();
        }
    }

    /// The device's static public key, if a private key is set
    pub fn public_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.static_keys.read().as_ref().map(|k| *k.public())
    }

    /// Bind (or rebind) the UDP socket. Port 0 picks an ephemeral port;
    /// the resolved port is returned and reported by `get`.
    pub fn set_listen_port(&self, port: u16) -> io::Result<u16> {
        let mut socket_guard = self.socket.write();
        let mut port_guard = self.listen_port.lock();

        if socket_guard.is_some() && port != 0 && *port_guard == port {
            return Ok(port);
        }

        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;
        let actual = socket.local_addr()?.port();

        *socket_guard = Some(Arc::new(socket));
        *port_guard = actual;
        info!("listening on port {}", actual);
        Ok(actual)
    }

    /// The bound port, 0 when no socket exists
    pub fn listen_port(&self) -> u16 {
        *self.listen_port.lock()
    }

    /// Send a datagram out the device socket
    pub(crate) fn send_udp(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let socket = self.socket.read().clone();
        match socket {
            Some(socket) => socket.send_to(data, dest),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no udp socket bound",
            )),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // PEER TABLE
    // ═══════════════════════════════════════════════════════════════════

    /// Look up a peer by its static public key
    pub fn find_peer(&self, public_key: &[u8; KEY_SIZE]) -> Option<Arc<Peer>> {
        self.peers.read().get(public_key).cloned()
    }

    /// Create a peer and spawn its sequential receiver
    pub fn new_peer(self: &Arc<Self>, public_key: [u8; KEY_SIZE]) -> Arc<Peer> {
        let peer = Peer::new(public_key);

        let device = Arc::clone(self);
        let task_peer = Arc::clone(&peer);
        let handle = thread::spawn(move || receive::run_peer_receiver(device, task_peer));
        *peer.thread.lock() = Some(handle);

        self.peers
            .write()
            .insert(public_key, Arc::clone(&peer));
        debug!("{} created", peer.log_id());
        peer
    }

    /// Remove a peer: its prefixes, its indexed key-pairs, its task
    pub fn remove_peer(&self, public_key: &[u8; KEY_SIZE]) {
        let peer = self.peers.write().remove(public_key);
        if let Some(peer) = peer {
            self.cleanup_peer(&peer);
            debug!("{} removed", peer.log_id());
        }
    }

    /// Remove every peer (control `replace_peers`)
    pub fn remove_all_peers(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut map = self.peers.write();
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &peers {
            self.cleanup_peer(peer);
        }
    }

    fn cleanup_peer(&self, peer: &Arc<Peer>) {
        self.routing.remove_peer(peer);
        for keypair in peer.keypairs.lock().clear() {
            self.index.remove(keypair.local_index);
        }
        {
            let mut handshake = peer.handshake.lock();
            let index = handshake.local_index();
            if index != 0 {
                self.index.remove_if_stale(index);
            }
            handshake.clear();
        }
        peer.shutdown();
        while let Ok(elem) = peer.inbound_rx.try_recv() {
            elem.evict(&self.pool);
        }
    }

    /// Number of configured peers
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    // ═══════════════════════════════════════════════════════════════════
    // KEY LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    /// Find the peer whose in-flight handshake owns a receiver id; used for
    /// handshake responses and cookie replies addressed to us
    pub(crate) fn lookup_handshake_peer(&self, index: u32) -> Option<Arc<Peer>> {
        let peers = self.peers.read();
        peers
            .values()
            .find(|peer| peer.handshake.lock().local_index() == index)
            .cloned()
    }

    /// Wrap freshly derived session keys into a key-pair, install it in the
    /// peer's `next` slot and index it
    pub(crate) fn install_key_pair(&self, peer: &Arc<Peer>, session: SessionKeys) {
        let keypair = Arc::new(KeyPair::new(session));
        self.index.set_key_pair(keypair.local_index, &keypair);
        let displaced = peer.keypairs.lock().install_next(Arc::clone(&keypair));
        if let Some(old) = displaced {
            self.index.remove(old.local_index);
        }
    }

    /// Whether the under-load gate is currently engaged
    pub fn is_under_load(&self) -> bool {
        self.under_load.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("peers", &self.peer_count())
            .field("listen_port", &self.listen_port())
            .finish_non_exhaustive()
    }
}
