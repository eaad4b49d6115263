//! The local UDP socket: receives from clients, demultiplexes by source
//! address into outers, and writes queued replies back out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use metrics::gauge;
use mio::event::Event;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::datagram::outer::DatagramOuter;
use crate::datagram::queue::{DatagramMessage, DatagramQueue, PENDING_BYTES_LIMIT, PENDING_LIMIT};
use crate::reactor::{ControlOp, Core, EventHandler};
use crate::sockopt::{self, UdpSocketOptions};

/// The demultiplexer bound to the proxy's local address.
///
/// Holds exactly the live outers; removing an entry is the only way an
/// outer's socket is destroyed (apart from full shutdown).
pub(crate) struct DatagramInner {
    sock: UdpSocket,
    token: Token,
    registered: Option<Interest>,
    local: SocketAddr,
    remote: SocketAddr,
    opts: UdpSocketOptions,
    scratch: Box<[u8]>,
    outers: HashMap<SocketAddr, Rc<RefCell<DatagramOuter>>>,
    reply_queue: DatagramQueue,
    max_idle: Duration,
    frozen: bool,
    me: Weak<RefCell<DatagramInner>>,
}

impl DatagramInner {
    /// Binds the local socket and registers it for READ. Returns the
    /// handler token and the bound address.
    pub(crate) fn spawn(
        core: &mut Core,
        local: SocketAddr,
        remote: SocketAddr,
        opts: UdpSocketOptions,
        max_idle: Duration,
    ) -> io::Result<(Token, SocketAddr)> {
        let (mut sock, scratch_size) = sockopt::bind_udp(local, &opts)?;
        let local = sock.local_addr()?;
        let token = core.next_token();
        core.register_io(&mut sock, token, Interest::READABLE)?;

        let inner = Rc::new_cyclic(|me| {
            RefCell::new(DatagramInner {
                sock,
                token,
                registered: Some(Interest::READABLE),
                local,
                remote,
                opts,
                scratch: vec![0u8; scratch_size].into_boxed_slice(),
                outers: HashMap::new(),
                reply_queue: DatagramQueue::new(PENDING_LIMIT, PENDING_BYTES_LIMIT),
                max_idle,
                frozen: false,
                me: me.clone(),
            })
        });
        core.insert_handler(token, inner);

        debug!(local = %local, remote = %remote, "datagram crusher listening");
        Ok((token, local))
    }

    /// Queues a reply for a client, called by outers. Sets WRITE interest
    /// so the loop flushes it. The entry keeps no reference to the outer
    /// that produced it: a reply enqueued just before its outer closes is
    /// still delivered.
    pub(crate) fn enqueue_reply(
        &mut self,
        core: &mut Core,
        message: DatagramMessage,
    ) -> io::Result<()> {
        self.reply_queue.push(message);
        self.apply_interest(core)
    }

    /// Drops the outer keyed by `client_addr` from the map; its socket
    /// closes once the last reference is gone.
    pub(crate) fn remove_outer(&mut self, client_addr: SocketAddr) {
        if self.outers.remove(&client_addr).is_some() {
            gauge!("netvice_udp_outers_active").decrement(1.0);
        }
    }

    fn apply_interest(&mut self, core: &mut Core) -> io::Result<()> {
        let desired = if self.frozen {
            None
        } else if self.reply_queue.is_empty() {
            Some(Interest::READABLE)
        } else {
            Some(Interest::READABLE | Interest::WRITABLE)
        };
        core.set_interest(&mut self.sock, self.token, &mut self.registered, desired)
    }

    fn read_ready(&mut self, core: &mut Core) {
        loop {
            match self.sock.recv_from(&mut self.scratch) {
                Ok((n, src)) => {
                    trace!(client = %src, len = n, "received from client");
                    let payload = self.scratch[..n].to_vec();
                    match self.ensure_outer(core, src) {
                        Ok(outer) => {
                            let _ = outer.borrow_mut().enqueue_upstream(core, payload);
                        }
                        Err(e) => {
                            warn!(client = %src, error = %e, "failed to open outer");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient (often an ICMP error queued on the
                    // socket); the inner keeps serving.
                    warn!(local = %self.local, error = %e, "inner read failed");
                    break;
                }
            }
        }
    }

    fn write_ready(&mut self, _core: &mut Core) {
        while let Some(message) = self.reply_queue.front() {
            match self.sock.send_to(&message.payload, message.addr) {
                Ok(n) => {
                    trace!(client = %message.addr, len = n, "reply sent");
                    self.reply_queue.pop();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(local = %self.local, error = %e, "reply send failed");
                    self.reply_queue.pop();
                }
            }
        }
    }

    /// Looks up or creates the outer for `src`. A new source triggers the
    /// idle sweep first, so the map never accumulates dead flows faster
    /// than new ones arrive.
    fn ensure_outer(
        &mut self,
        core: &mut Core,
        src: SocketAddr,
    ) -> io::Result<Rc<RefCell<DatagramOuter>>> {
        if let Some(outer) = self.outers.get(&src) {
            return Ok(outer.clone());
        }

        if !self.max_idle.is_zero() {
            self.sweep(core);
        }

        let outer = DatagramOuter::spawn(core, self.me.clone(), src, self.remote, &self.opts)?;
        self.outers.insert(src, outer.clone());
        gauge!("netvice_udp_outers_active").increment(1.0);
        Ok(outer)
    }

    /// Evicts every outer idle longer than the configured threshold.
    fn sweep(&mut self, core: &mut Core) {
        let before = self.outers.len();
        if before == 0 {
            return;
        }

        let now = Instant::now();
        let max_idle = self.max_idle;
        self.outers.retain(|addr, outer| {
            let mut outer = outer.borrow_mut();
            if outer.idle_duration(now) > max_idle {
                outer.teardown(core);
                debug!(client = %addr, "idle outer evicted");
                false
            } else {
                true
            }
        });

        let after = self.outers.len();
        if after < before {
            debug!(before, after, "idle outers swept");
            gauge!("netvice_udp_outers_active").decrement((before - after) as f64);
        }
    }

    fn set_frozen(&mut self, core: &mut Core, frozen: bool) -> io::Result<()> {
        if self.frozen != frozen {
            self.frozen = frozen;
            self.apply_interest(core)?;
        }
        for outer in self.outers.values() {
            outer.borrow_mut().set_frozen(core, frozen)?;
        }
        debug!(local = %self.local, frozen, "datagram crusher freeze state");
        Ok(())
    }

    /// Full teardown: local socket and every outer.
    fn shutdown(&mut self, core: &mut Core) {
        for outer in self.outers.values() {
            outer.borrow_mut().teardown(core);
        }
        gauge!("netvice_udp_outers_active").decrement(self.outers.len() as f64);
        self.outers.clear();

        if self.registered.take().is_some() {
            let _ = core.deregister_io(&mut self.sock);
        }
        core.remove_handler(self.token);
        debug!(local = %self.local, "datagram crusher closed");
    }
}

impl EventHandler for DatagramInner {
    fn on_ready(&mut self, core: &mut Core, _token: Token, event: &Event) -> io::Result<()> {
        if event.is_readable() {
            self.read_ready(core);
        }
        if event.is_writable() {
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
                self.shutdown(core);
                Ok(())
            }
            ControlOp::SessionCount(reply) => {
                let _ = reply.send(self.outers.len());
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
