use std::io;

/// Inbound stream buffer size.
pub const READ_BUF_SIZE: usize = 65536;
/// Outbound stream buffer size; sized generously so a burst of outgoing
/// messages survives a slow peer.
pub const WRITE_BUF_SIZE: usize = 8 * 65536;

/// A bounded contiguous byte queue between a socket and the protocol layer.
/// Data is appended at the tail and drained from the head; the head storage
/// is compacted away once it dominates the allocation.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(limit.min(4096)),
            head: 0,
            limit,
        }
    }

    /// The number of readable bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining room before the limit.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.len()
    }

    /// Readable contents.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Mutable view of the readable contents; used to decipher bytes that
    /// were buffered before the stream was rekeyed.
    #[inline]
    pub fn read_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Drops `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        self.compact();
    }

    /// Appends bytes at the tail; false (and no change) when the limit
    /// would be exceeded.
    pub fn extend(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.free_capacity() {
            return false;
        }

        self.data.extend_from_slice(bytes);
        true
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Writes buffered data to the supplied writer until the buffer drains
    /// or the writer blocks. A zero-length write is an error to avoid
    /// spinning on a broken sink.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut sent = 0;

        while self.len() > 0 {
            let count = writer.write(self.read_slice())?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.head += count;
            sent += count;
        }

        self.compact();
        Ok(sent)
    }

    fn compact(&mut self) {
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > 4096 && self.head * 2 > self.data.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}
