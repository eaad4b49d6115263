//! The proxy's upstream UDP socket dedicated to one observed source.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use metrics::counter;
use mio::event::Event;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::datagram::inner::DatagramInner;
use crate::datagram::queue::{DatagramMessage, DatagramQueue, PENDING_BYTES_LIMIT, PENDING_LIMIT};
use crate::reactor::{ControlOp, Core, EventHandler};
use crate::sockopt::{self, UdpSocketOptions};

/// One virtual connection: a connected upstream socket whose lifetime is
/// tied to a single client source address.
///
/// The inner socket is reached through a weak capability; if the inner is
/// gone the outer shuts itself down on the next event.
pub(crate) struct DatagramOuter {
    client_addr: SocketAddr,
    remote: SocketAddr,
    sock: UdpSocket,
    token: Token,
    registered: Option<Interest>,
    scratch: Box<[u8]>,
    upstream_queue: DatagramQueue,
    last_op: Instant,
    frozen: bool,
    inner: Weak<RefCell<DatagramInner>>,
}

impl DatagramOuter {
    /// Opens a socket connected to `remote` and registers it for READ.
    pub(crate) fn spawn(
        core: &mut Core,
        inner: Weak<RefCell<DatagramInner>>,
        client_addr: SocketAddr,
        remote: SocketAddr,
        opts: &UdpSocketOptions,
    ) -> io::Result<Rc<RefCell<DatagramOuter>>> {
        let (mut sock, scratch_size) = sockopt::connect_udp(remote, opts)?;
        let token = core.next_token();
        core.register_io(&mut sock, token, Interest::READABLE)?;

        let outer = Rc::new(RefCell::new(DatagramOuter {
            client_addr,
            remote,
            sock,
            token,
            registered: Some(Interest::READABLE),
            scratch: vec![0u8; scratch_size].into_boxed_slice(),
            upstream_queue: DatagramQueue::new(PENDING_LIMIT, PENDING_BYTES_LIMIT),
            last_op: Instant::now(),
            frozen: false,
            inner,
        }));
        core.insert_handler(token, outer.clone());

        debug!(client = %client_addr, remote = %remote, "outer started");
        Ok(outer)
    }

    pub(crate) fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Time since the last successful upstream read or write.
    pub(crate) fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_op)
    }

    /// Queues a client payload for the remote, or drops it at the
    /// pending limit.
    pub(crate) fn enqueue_upstream(
        &mut self,
        core: &mut Core,
        payload: Vec<u8>,
    ) -> io::Result<()> {
        self.upstream_queue.push(DatagramMessage {
            addr: self.remote,
            payload,
        });
        self.apply_interest(core)
    }

    pub(crate) fn set_frozen(&mut self, core: &mut Core, frozen: bool) -> io::Result<()> {
        if self.frozen != frozen {
            self.frozen = frozen;
            self.apply_interest(core)?;
        }
        Ok(())
    }

    /// Deregisters and detaches this outer; the socket closes when the
    /// last reference drops. Never touches the inner: map removal is the
    /// caller's side of the protocol.
    pub(crate) fn teardown(&mut self, core: &mut Core) {
        if self.registered.take().is_some() {
            let _ = core.deregister_io(&mut self.sock);
        }
        core.remove_handler(self.token);
        debug!(client = %self.client_addr, remote = %self.remote, "outer closed");
    }

    fn apply_interest(&mut self, core: &mut Core) -> io::Result<()> {
        let desired = if self.frozen {
            None
        } else if self.upstream_queue.is_empty() {
            Some(Interest::READABLE)
        } else {
            Some(Interest::READABLE | Interest::WRITABLE)
        };
        core.set_interest(&mut self.sock, self.token, &mut self.registered, desired)
    }

    fn read_ready(&mut self, core: &mut Core) {
        loop {
            match self.sock.recv(&mut self.scratch) {
                Ok(n) => {
                    self.last_op = Instant::now();
                    trace!(client = %self.client_addr, len = n, "read from remote");
                    counter!("netvice_udp_reply_packets_total").increment(1);

                    let payload = self.scratch[..n].to_vec();
                    let Some(inner) = self.inner.upgrade() else {
                        self.teardown(core);
                        return;
                    };
                    let _ = inner.borrow_mut().enqueue_reply(
                        core,
                        DatagramMessage {
                            addr: self.client_addr,
                            payload,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Typically an ICMP port-unreachable surfaced on the
                    // connected socket: the flow is dead.
                    warn!(remote = %self.remote, error = %e, "upstream read failed");
                    self.teardown(core);
                    if let Some(inner) = self.inner.upgrade() {
                        inner.borrow_mut().remove_outer(self.client_addr);
                    }
                    return;
                }
            }
        }
    }

    fn write_ready(&mut self, _core: &mut Core) {
        while let Some(message) = self.upstream_queue.front() {
            match self.sock.send(&message.payload) {
                Ok(n) => {
                    self.last_op = Instant::now();
                    trace!(remote = %self.remote, len = n, "written to remote");
                    counter!("netvice_udp_forward_packets_total").increment(1);
                    self.upstream_queue.pop();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The datagram is undeliverable; drop it and move on.
                    warn!(remote = %self.remote, error = %e, "upstream write failed");
                    self.upstream_queue.pop();
                }
            }
        }
    }
}

impl EventHandler for DatagramOuter {
    fn on_ready(&mut self, core: &mut Core, _token: Token, event: &Event) -> io::Result<()> {
        if event.is_readable() {
            self.read_ready(core);
        }
        if event.is_writable() && self.registered.is_some() {
            self.write_ready(core);
        }
        if self.registered.is_some() {
            self.apply_interest(core)?;
        }
        Ok(())
    }

    fn on_control(&mut self, core: &mut Core, op: ControlOp) -> io::Result<()> {
        match op {
            ControlOp::Freeze => self.set_frozen(core, true),
            ControlOp::Unfreeze => self.set_frozen(core, false),
            ControlOp::Shutdown => {
                self.teardown(core);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
