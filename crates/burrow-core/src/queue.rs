//! # Bounded Queues
//!
//! The engine's stages cooperate over bounded channels. Insertion follows a
//! drop-oldest discipline: a full queue evicts its head (marking the evicted
//! element dropped and reclaiming its buffer) so a push always completes in
//! bounded time. The freshness bias keeps handshake storms and transport
//! floods from wedging the pipeline.
//!
//! Between the decryption workers and the per-peer sequential receiver, each
//! inbound element carries a one-shot completion latch: the receiver blocks
//! on it until the worker has finished the AEAD open (in whatever order the
//! workers get to it).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use crate::buffer::{BufferPool, MessageBuffer};
use crate::keypair::KeyPair;
use burrow_protocol::MessageType;

/// Device-wide handshake queue capacity
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

/// Handshake queue depth above which a tick counts as busy
pub const QUEUE_HANDSHAKE_BUSY_SIZE: usize = 256;

/// Device-wide decryption queue capacity
pub const QUEUE_DECRYPTION_SIZE: usize = 1024;

/// Device-wide inbound (tunnel writer) queue capacity
pub const QUEUE_INBOUND_SIZE: usize = 1024;

/// Per-peer inbound queue capacity
pub const QUEUE_PEER_INBOUND_SIZE: usize = 1024;

// ═══════════════════════════════════════════════════════════════════════════
// COMPLETION LATCH
// ═══════════════════════════════════════════════════════════════════════════

/// One-shot handoff between a decryption worker and the sequential receiver
pub struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Mark the element processed and wake the waiter
    pub fn open(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Block until the element has been processed
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE ELEMENTS
// ═══════════════════════════════════════════════════════════════════════════

/// An element a queue can shed when full
pub trait Evict {
    /// Release ownership (buffer, latch) without doing the work
    fn evict(self, pool: &BufferPool);
}

/// A handshake datagram awaiting the handshake pump; owns its buffer
pub struct HandshakeElement {
    pub msg_type: MessageType,
    pub buffer: MessageBuffer,
    pub len: usize,
    pub source: SocketAddr,
}

impl Evict for HandshakeElement {
    fn evict(self, pool: &BufferPool) {
        pool.put(self.buffer);
    }
}

/// Mutable packet state of an inbound element, guarded by its mutex
pub struct InboundState {
    /// The leased buffer; taken by whichever stage finishes the element
    pub buffer: Option<MessageBuffer>,
    /// Start of the current packet slice within the buffer
    pub start: usize,
    /// End of the current packet slice within the buffer
    pub end: usize,
    /// Transport counter, extracted by the decryption worker
    pub counter: u64,
}

/// A transport datagram shared between the decryption queue and its peer's
/// inbound queue
pub struct InboundElement {
    /// The key-pair that will decrypt this element
    pub keypair: Arc<KeyPair>,
    dropped: AtomicBool,
    /// Opened by the decryption worker once the AEAD open has happened
    pub latch: Latch,
    /// Packet bytes and slice bounds
    pub state: Mutex<InboundState>,
}

impl InboundElement {
    /// Lease `buffer[..len]` as a new element bound to `keypair`
    pub fn new(keypair: Arc<KeyPair>, buffer: MessageBuffer, len: usize) -> Arc<Self> {
        Arc::new(Self {
            keypair,
            dropped: AtomicBool::new(false),
            latch: Latch::new(),
            state: Mutex::new(InboundState {
                buffer: Some(buffer),
                start: 0,
                end: len,
                counter: 0,
            }),
        })
    }

    /// Mark the element dropped; later stages release it without work
    pub fn drop_packet(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    /// Take the buffer out, if a prior stage has not already
    pub fn take_buffer(&self) -> Option<MessageBuffer> {
        self.state.lock().buffer.take()
    }
}

impl Evict for Arc<InboundElement> {
    fn evict(self, pool: &BufferPool) {
        self.drop_packet();
        if let Some(buf) = self.take_buffer() {
            pool.put(buf);
        }
        // the twin copy of this element may sit on another queue behind a
        // waiting receiver
        self.latch.open();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DROP-OLDEST PUSH
// ═══════════════════════════════════════════════════════════════════════════

/// Push onto a bounded queue, evicting the head once if full. If the queue
/// is still full after the single eviction (producers racing), the incoming
/// element is shed instead; the push never blocks.
pub fn send_drop_oldest<T: Evict>(tx: &Sender<T>, rx: &Receiver<T>, pool: &BufferPool, elem: T) {
    let elem = match tx.try_send(elem) {
        Ok(()) => return,
        Err(TrySendError::Full(elem)) => elem,
        Err(TrySendError::Disconnected(elem)) => {
            elem.evict(pool);
            return;
        }
    };

    if let Ok(old) = rx.try_recv() {
        old.evict(pool);
    }
    if let Err(err) = tx.try_send(elem) {
        err.into_inner().evict(pool);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_protocol::SessionKeys;
    use crossbeam_channel::bounded;
    use zeroize::Zeroizing;

    fn test_keypair() -> Arc<KeyPair> {
        Arc::new(KeyPair::new(SessionKeys {
            send: Zeroizing::new([1u8; 32]),
            receive: Zeroizing::new([2u8; 32]),
            local_index: 1,
            remote_index: 2,
            is_initiator: false,
        }))
    }

    fn element(pool: &BufferPool) -> Arc<InboundElement> {
        InboundElement::new(test_keypair(), pool.get(), 64)
    }

    #[test]
    fn test_latch_open_before_wait() {
        let latch = Latch::new();
        latch.open();
        latch.wait();
    }

    #[test]
    fn test_latch_cross_thread() {
        let elem = InboundElement::new(test_keypair(), BufferPool::new().get(), 0);
        let elem2 = Arc::clone(&elem);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            elem2.latch.open();
        });

        elem.latch.wait();
        handle.join().unwrap();
    }

    #[test]
    fn test_drop_oldest_keeps_push_bounded() {
        let pool = BufferPool::new();
        let (tx, rx) = bounded(2);

        let first = element(&pool);
        send_drop_oldest(&tx, &rx, &pool, Arc::clone(&first));
        send_drop_oldest(&tx, &rx, &pool, element(&pool));
        // queue is full; this push evicts `first`
        send_drop_oldest(&tx, &rx, &pool, element(&pool));

        assert!(first.is_dropped());
        assert!(first.take_buffer().is_none());
        assert_eq!(rx.len(), 2);

        // the evicted element's latch is open so a waiter cannot hang
        first.latch.wait();
    }

    #[test]
    fn test_drop_oldest_handshake_recycles_buffer() {
        let pool = BufferPool::new();
        let (tx, rx) = bounded::<HandshakeElement>(1);
        let source: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let mut marked = pool.get();
        marked[0] = 0x77;
        send_drop_oldest(
            &tx,
            &rx,
            &pool,
            HandshakeElement {
                msg_type: MessageType::Initiation,
                buffer: marked,
                len: 148,
                source,
            },
        );
        send_drop_oldest(
            &tx,
            &rx,
            &pool,
            HandshakeElement {
                msg_type: MessageType::Initiation,
                buffer: pool.get(),
                len: 148,
                source,
            },
        );

        // the first buffer went back to the pool when its element was shed
        let recycled = pool.get();
        assert_eq!(recycled[0], 0x77);
    }

    #[test]
    fn test_drop_oldest_racing_producers() {
        // a push that still finds the queue full after one eviction sheds
        // the incoming element rather than looping
        let pool = BufferPool::new();
        let (tx, rx) = bounded(1);

        send_drop_oldest(&tx, &rx, &pool, element(&pool));
        let loser = element(&pool);
        // simulate a racing producer refilling the slot between evict and
        // retry by making the eviction a no-op
        let (empty_tx, empty_rx) = bounded::<Arc<InboundElement>>(1);
        drop(empty_tx);
        send_drop_oldest(&tx, &empty_rx, &pool, Arc::clone(&loser));

        assert!(loser.is_dropped());
        assert_eq!(rx.len(), 1);
    }
}
