//! Bounded ring of fixed-size byte buffers between the two sockets of a
//! pair.
//!
//! One transfer fills the tail slot from its socket while the peer
//! transfer drains the head slot into the other socket, both on the
//! reactor thread. A slot is recycled only once fully drained, so at most
//! one slot is partially filled (the tail) and one partially drained (the
//! head) at any time. When the ring is full the reader side must stop
//! reading; that is how backpressure reaches the fast socket.

/// Single-producer single-consumer pipe with fixed capacity.
pub struct TransferQueue {
    slots: Vec<Slot>,
    head: usize,
    /// Slots in use, including a partially filled tail.
    filled: usize,
    pending_bytes: usize,
}

struct Slot {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn unread(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn space(&self) -> usize {
        self.buf.len() - self.write_pos
    }
}

impl TransferQueue {
    /// Creates a queue of `buffer_count` buffers of `buffer_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    pub fn new(buffer_count: usize, buffer_size: usize) -> Self {
        assert!(buffer_count > 0, "buffer count must be positive");
        assert!(buffer_size > 0, "buffer size must be positive");
        Self {
            slots: (0..buffer_count).map(|_| Slot::new(buffer_size)).collect(),
            head: 0,
            filled: 0,
            pending_bytes: 0,
        }
    }

    /// Returns writable space at the tail: the remainder of the current
    /// tail slot, or a fresh slot, or `None` when the ring is full.
    pub fn fill_slot(&mut self) -> Option<&mut [u8]> {
        let cap = self.slots.len();

        if self.filled > 0 {
            let tail = (self.head + self.filled - 1) % cap;
            if self.slots[tail].space() > 0 {
                let slot = &mut self.slots[tail];
                return Some(&mut slot.buf[slot.write_pos..]);
            }
        }

        if self.filled < cap {
            let idx = (self.head + self.filled) % cap;
            self.filled += 1;
            let slot = &mut self.slots[idx];
            slot.reset();
            return Some(&mut slot.buf[..]);
        }

        None
    }

    /// Records `n` bytes written into the space returned by the last
    /// [`fill_slot`](Self::fill_slot) call.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled > 0, "commit without fill_slot");
        let tail = (self.head + self.filled - 1) % self.slots.len();
        let slot = &mut self.slots[tail];
        debug_assert!(n <= slot.space());
        slot.write_pos += n;
        self.pending_bytes += n;
    }

    /// Returns the unread bytes of the oldest non-empty slot.
    pub fn drain_slot(&self) -> Option<&[u8]> {
        if self.pending_bytes == 0 {
            return None;
        }
        let slot = &self.slots[self.head];
        Some(&slot.buf[slot.read_pos..slot.write_pos])
    }

    /// Consumes `n` bytes from the head slot, recycling it once drained.
    pub fn consume(&mut self, n: usize) {
        let cap = self.slots.len();
        let slot = &mut self.slots[self.head];
        debug_assert!(n <= slot.unread());
        slot.read_pos += n;
        self.pending_bytes -= n;

        if slot.unread() == 0 {
            if self.filled == 1 {
                // The head is also the tail; rewind in place so the next
                // read starts on a clean slot.
                slot.reset();
                self.filled = 0;
            } else {
                slot.reset();
                self.head = (self.head + 1) % cap;
                self.filled -= 1;
            }
        }
    }

    /// Count of slots holding undrained bytes.
    pub fn pending(&self) -> usize {
        (0..self.filled)
            .map(|i| (self.head + i) % self.slots.len())
            .filter(|&i| self.slots[i].unread() > 0)
            .count()
    }

    /// Total undrained bytes across all slots.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes == 0
    }

    /// True while the tail can still accept bytes.
    pub fn has_space(&self) -> bool {
        if self.filled < self.slots.len() {
            return true;
        }
        let tail = (self.head + self.filled - 1) % self.slots.len();
        self.slots[tail].space() > 0
    }
}
