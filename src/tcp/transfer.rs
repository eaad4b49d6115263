//! One direction of a pair: source socket -> buffer queue -> sink socket.

use std::io::{self, Read, Write};

use metrics::counter;
use mio::net::TcpStream;
use tracing::trace;

use crate::tcp::queue::TransferQueue;

/// Why a read pass stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStop {
    /// The socket has no more bytes for now.
    WouldBlock,
    /// The queue has no more space; READ interest must drop until the
    /// peer drains a buffer.
    QueueFull,
    /// The source closed its write half.
    Eof,
}

/// Why a drain pass stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainStop {
    /// The sink cannot take more bytes for now.
    WouldBlock,
    /// Everything buffered has been written.
    Empty,
}

/// A directional relay owning its outgoing queue and byte counter.
pub struct TcpTransfer {
    label: &'static str,
    queue: TransferQueue,
    total_bytes: u64,
}

impl TcpTransfer {
    pub fn new(label: &'static str, buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            label,
            queue: TransferQueue::new(buffer_count, buffer_size),
            total_bytes: 0,
        }
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    /// Total bytes read from the source so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Reads from `source` into the queue until the socket blocks, the
    /// queue fills, or the source reaches EOF.
    ///
    /// Returns the byte count moved and the stop reason. ECONNRESET and
    /// friends propagate as errors; EOF does not.
    pub fn read_from(&mut self, source: &mut TcpStream) -> io::Result<(usize, ReadStop)> {
        let mut moved = 0;

        let stop = loop {
            let Some(space) = self.queue.fill_slot() else {
                break ReadStop::QueueFull;
            };

            match source.read(space) {
                Ok(0) => break ReadStop::Eof,
                Ok(n) => {
                    self.queue.commit(n);
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadStop::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if moved > 0 {
            self.total_bytes += moved as u64;
            counter!("netvice_tcp_relayed_bytes_total", "direction" => self.label)
                .increment(moved as u64);
            trace!(direction = self.label, len = moved, "read into queue");
        }

        Ok((moved, stop))
    }

    /// Drains the queue into `sink` until the socket blocks or the queue
    /// empties.
    pub fn drain_into(&mut self, sink: &mut TcpStream) -> io::Result<(usize, DrainStop)> {
        let mut moved = 0;

        let stop = loop {
            let Some(data) = self.queue.drain_slot() else {
                break DrainStop::Empty;
            };

            match sink.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.queue.consume(n);
                    moved += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break DrainStop::WouldBlock,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if moved > 0 {
            trace!(direction = self.label, len = moved, "drained into socket");
        }

        Ok((moved, stop))
    }
}
