//! # Message Buffer Pool
//!
//! Recyclable fixed-size datagram buffers. Buffers are leased at ingress and
//! returned when the owning stage drops or delivers the packet; a returned
//! buffer is reused without zeroing since its contents are overwritten before
//! any read.

use burrow_protocol::MAX_MESSAGE_SIZE;
use parking_lot::Mutex;

/// A pooled datagram buffer
pub type MessageBuffer = Box<[u8; MAX_MESSAGE_SIZE]>;

/// Free buffers kept around between packets
const POOL_KEEP: usize = 1024;

/// Pool of message buffers. Allocates on demand; recycling is an
/// optimization, not a correctness requirement.
pub struct BufferPool {
    free: Mutex<Vec<MessageBuffer>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Lease a buffer
    pub fn get(&self) -> MessageBuffer {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        Box::new([0u8; MAX_MESSAGE_SIZE])
    }

    /// Return a buffer. Callers must not retain references after this.
    pub fn put(&self, buf: MessageBuffer) {
        let mut free = self.free.lock();
        if free.len() < POOL_KEEP {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_recycles() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf[0] = 0xAB;
        pool.put(buf);

        // the recycled buffer comes back as-is
        let buf = pool.get();
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_allocates_on_demand() {
        let pool = BufferPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_eq!(a.len(), b.len());
    }
}
