//! Bounded pending queue for datagrams awaiting a writable socket.

use metrics::counter;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::warn;

/// Default cap on queued datagrams per socket.
pub const PENDING_LIMIT: usize = 1024;

/// Default cap on queued bytes per socket.
pub const PENDING_BYTES_LIMIT: usize = 16 * 1024 * 1024;

/// One datagram captured at enqueue time. The payload is copied out of
/// the receive scratch buffer because datagrams are fire-and-forget and
/// the scratch is reused immediately.
#[derive(Debug)]
pub struct DatagramMessage {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

/// FIFO of datagrams with entry-count and byte caps. Beyond either cap
/// the packet is dropped with a log record; that is the UDP backpressure
/// policy.
pub struct DatagramQueue {
    entries: VecDeque<DatagramMessage>,
    pending_bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl DatagramQueue {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            pending_bytes: 0,
            max_entries,
            max_bytes,
        }
    }

    /// Enqueues a datagram, or drops it when a cap is exceeded. Returns
    /// whether the datagram was queued.
    pub fn push(&mut self, message: DatagramMessage) -> bool {
        if self.entries.len() >= self.max_entries {
            warn!(
                pending = self.entries.len(),
                "pending limit exceeded, packet dropped"
            );
            counter!("netvice_udp_dropped_packets_total").increment(1);
            return false;
        }
        if self.pending_bytes + message.payload.len() > self.max_bytes {
            warn!(
                pending_bytes = self.pending_bytes,
                "pending byte limit exceeded, packet dropped"
            );
            counter!("netvice_udp_dropped_packets_total").increment(1);
            return false;
        }

        self.pending_bytes += message.payload.len();
        self.entries.push_back(message);
        true
    }

    /// The oldest queued datagram, left in place.
    pub fn front(&self) -> Option<&DatagramMessage> {
        self.entries.front()
    }

    /// Removes the oldest queued datagram.
    pub fn pop(&mut self) -> Option<DatagramMessage> {
        let message = self.entries.pop_front()?;
        self.pending_bytes -= message.payload.len();
        Some(message)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }
}
