use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Initial ring capacity for a fresh mailbox.
pub const MBOX_INITIAL_SIZE: usize = 4096;
/// Hard ceiling on mailbox growth (1 MiB).
pub const MAX_MBOX_SIZE: usize = 1 << 20;

struct Ring {
    data: Box<[u8]>,
    read: usize,
    write: usize,
    total: u64,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Ring {
        debug_assert!(capacity.is_power_of_two());
        Ring {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            total: 0,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.data.len() - 1
    }

    #[inline]
    fn len(&self) -> usize {
        self.write.wrapping_sub(self.read) & self.mask()
    }

    /// One slot is sacrificed so a full ring is distinguishable from an
    /// empty one: `len + room == capacity - 1`.
    #[inline]
    fn room(&self) -> usize {
        self.capacity() - 1 - self.len()
    }

    fn append(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.room());

        let capacity = self.capacity();
        let first = bytes.len().min(capacity - self.write);
        self.data[self.write..self.write + first].copy_from_slice(&bytes[..first]);
        self.data[..bytes.len() - first].copy_from_slice(&bytes[first..]);

        self.write = (self.write + bytes.len()) & self.mask();
        self.total += bytes.len() as u64;
    }

    fn consume(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.len());
        let capacity = self.capacity();

        let first = count.min(capacity - self.read);
        buf[..first].copy_from_slice(&self.data[self.read..self.read + first]);
        buf[first..count].copy_from_slice(&self.data[..count - first]);

        self.read = (self.read + count) & self.mask();
        count
    }

    /// Doubles the ring, linearizing the contents at offset zero.
    fn grow(&mut self) {
        let len = self.len();
        let mut fresh = vec![0u8; self.capacity() * 2].into_boxed_slice();

        let first = len.min(self.capacity() - self.read);
        fresh[..first].copy_from_slice(&self.data[self.read..self.read + first]);
        fresh[first..len].copy_from_slice(&self.data[..len - first]);

        self.data = fresh;
        self.read = 0;
        self.write = len;
    }

    /// Grows until `needed` bytes fit or the ceiling is reached. Writers use
    /// this so a burst of posts is bounded by the ceiling rather than the
    /// initial allocation.
    fn ensure_room(&mut self, needed: usize, ceiling: usize) {
        while self.room() < needed && self.capacity() < ceiling {
            self.grow();
        }
    }
}

/// A process's inbox: a lock-protected byte FIFO with transactional
/// multi-chunk appends. Senders serialize whole messages into the ring;
/// the owning process drains and re-parses them. Writers only ever advance
/// the write index and readers the read index, so a reader never observes a
/// partially committed message.
pub struct Mailbox {
    ring: Mutex<Ring>,
    ceiling: usize,
}

impl Mailbox {
    /// Creates a mailbox with the given initial capacity (rounded up to a
    /// power of two) and the default growth ceiling.
    #[inline]
    pub fn new(capacity: usize) -> Mailbox {
        Mailbox::with_ceiling(capacity, MAX_MBOX_SIZE)
    }

    pub fn with_ceiling(capacity: usize, ceiling: usize) -> Mailbox {
        let capacity = capacity.max(2).next_power_of_two();
        let ceiling = ceiling.max(capacity);

        Mailbox {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            ceiling,
        }
    }

    /// Atomically appends a whole message, growing toward the ceiling when
    /// needed. Returns false, with no observable side effect, when the ring
    /// cannot make room.
    pub fn post(&self, bytes: &[u8]) -> bool {
        let mut ring = self.lock();
        ring.ensure_room(bytes.len(), self.ceiling);

        if ring.room() < bytes.len() {
            return false;
        }

        ring.append(bytes);
        true
    }

    /// Opens a transactional append. The mailbox lock is held until the
    /// appender commits or is dropped; dropping without commit rolls back.
    /// The snapshot is the buffered length, which stays valid across ring
    /// growth.
    pub fn begin_append(&self) -> Appender {
        let ring = self.lock();
        let snapshot_len = ring.len();
        let snapshot_total = ring.total;

        Appender {
            ceiling: self.ceiling,
            ring: Some(ring),
            snapshot_len,
            snapshot_total,
            overflow: false,
            committed: false,
        }
    }

    /// Consumes up to `buf.len()` bytes. When occupancy still exceeds half
    /// the capacity afterwards, the ring doubles (up to the ceiling) so a
    /// congested reader stops rejecting writers.
    pub fn drain(&self, buf: &mut [u8]) -> usize {
        let mut ring = self.lock();
        let count = ring.consume(buf);

        if ring.len() > ring.capacity() / 2 && ring.capacity() < self.ceiling {
            ring.grow();
        }

        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock().len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    #[inline]
    pub fn room(&self) -> usize {
        self.lock().room()
    }

    /// Monotonic count of bytes ever committed into this mailbox.
    #[inline]
    pub fn total_written(&self) -> u64 {
        self.lock().total
    }

    #[inline]
    fn lock(&self) -> MutexGuard<Ring> {
        self.ring.lock().expect("Mailbox lock poisoned")
    }
}

/// An in-flight transactional append. Chunks accumulate until `commit`;
/// overflow marks the transaction dead and rewinds the write index to the
/// snapshot taken at `begin_append`.
pub struct Appender<'a> {
    ceiling: usize,
    ring: Option<MutexGuard<'a, Ring>>,
    snapshot_len: usize,
    snapshot_total: u64,
    overflow: bool,
    committed: bool,
}

impl<'a> Appender<'a> {
    /// Appends a chunk, growing toward the ceiling when needed. Once the
    /// transaction has overflowed, subsequent chunks are discarded.
    pub fn chunk(&mut self, bytes: &[u8]) {
        if self.overflow {
            return;
        }

        let ceiling = self.ceiling;
        let ring = self.ring.as_mut().expect("Appender used after commit");
        ring.ensure_room(bytes.len(), ceiling);

        if ring.room() < bytes.len() {
            self.overflow = true;
            return;
        }

        ring.append(bytes);
    }

    /// True when a chunk failed to fit.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    /// Commits the transaction. On overflow the write index is rewound to
    /// the snapshot and false is returned.
    pub fn commit(mut self) -> bool {
        if self.overflow {
            self.rollback();
            return false;
        }

        self.committed = true;
        self.ring.take();
        true
    }

    fn rollback(&mut self) {
        if let Some(mut ring) = self.ring.take() {
            let mask = ring.mask();
            ring.write = (ring.read + self.snapshot_len) & mask;
            ring.total = self.snapshot_total;
        }
    }
}

impl<'a> Drop for Appender<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

impl<'a> fmt::Write for Appender<'a> {
    /// Lets a serializer print straight into the ring; overflow is recorded
    /// rather than surfaced, and resolved at commit time.
    fn write_str(&mut self, text: &str) -> fmt::Result {
        self.chunk(text.as_bytes());
        Ok(())
    }
}
