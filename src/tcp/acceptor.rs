//! The listening side of a TCP crusher: accept, outbound connect with a
//! deadline, pair construction.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use metrics::counter;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use tracing::{debug, warn};

use crate::reactor::{ControlOp, Core, EventHandler, Handle, Schedule};
use crate::sockopt::{self, TcpSocketOptions};
use crate::tcp::pair::{PairRoster, TcpPair};

/// Owns the listening socket and turns each accepted connection into a
/// pair once the matching outbound connect completes.
pub(crate) struct TcpAcceptor {
    listener: TcpListener,
    token: Token,
    registered: Option<Interest>,
    local: SocketAddr,
    remote: SocketAddr,
    opts: TcpSocketOptions,
    buffer_count: usize,
    buffer_size: usize,
    roster: Rc<PairRoster>,
    handle: Handle,
    frozen: bool,
}

impl TcpAcceptor {
    /// Binds the listening socket and registers the acceptor for ACCEPT
    /// readiness. Returns its token for facade-side control along with
    /// the bound address.
    pub(crate) fn spawn(
        core: &mut Core,
        handle: Handle,
        local: SocketAddr,
        remote: SocketAddr,
        opts: TcpSocketOptions,
        buffer_count: usize,
        buffer_size: usize,
        roster: Rc<PairRoster>,
    ) -> io::Result<(Token, SocketAddr)> {
        let mut listener = sockopt::bind_tcp_listener(local, &opts)?;
        let local = listener.local_addr()?;
        let token = core.next_token();
        core.register_io(&mut listener, token, Interest::READABLE)?;

        let acceptor = Rc::new(RefCell::new(TcpAcceptor {
            listener,
            token,
            registered: Some(Interest::READABLE),
            local,
            remote,
            opts,
            buffer_count,
            buffer_size,
            roster,
            handle,
            frozen: false,
        }));
        core.insert_handler(token, acceptor);

        debug!(local = %local, remote = %remote, "tcp crusher listening");
        Ok((token, local))
    }

    fn accept_ready(&mut self, core: &mut Core) {
        loop {
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    debug!(local = %self.local, client = %peer, "connection accepted");
                    if let Err(e) = self.start_connect(core, sock) {
                        warn!(client = %peer, error = %e, "outbound connect failed to start");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::ConnectionAborted
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    // The peer vanished between readiness and accept.
                    warn!(local = %self.local, error = %e, "transient accept error");
                    continue;
                }
                Err(e) => {
                    // Transient by policy: the listening socket stays up.
                    warn!(local = %self.local, error = %e, "accept error");
                    break;
                }
            }
        }
    }

    fn start_connect(&mut self, core: &mut Core, client_sock: TcpStream) -> io::Result<()> {
        sockopt::apply_tcp_stream_options(&client_sock, &self.opts)?;

        let mut upstream = sockopt::connect_tcp(self.remote, &self.opts)?;
        let token = core.next_token();
        core.register_io(&mut upstream, token, Interest::WRITABLE)?;

        let timeout = if self.opts.connection_timeout.is_zero() {
            None
        } else {
            Some(
                self.handle
                    .schedule(self.opts.connection_timeout, move |core| {
                        if let Some(handler) = core.handler(token) {
                            let _ = handler
                                .borrow_mut()
                                .on_control(core, ControlOp::ConnectTimeout);
                        }
                    }),
            )
        };

        let pending = Rc::new(RefCell::new(PendingConnect {
            client_sock: Some(client_sock),
            upstream: Some(upstream),
            token,
            remote: self.remote,
            timeout,
            buffer_count: self.buffer_count,
            buffer_size: self.buffer_size,
            roster: Rc::clone(&self.roster),
        }));
        core.insert_handler(token, pending);
        Ok(())
    }

    fn close_sessions(&mut self, core: &mut Core) {
        let pairs: Vec<_> = self.roster.pairs.borrow().values().cloned().collect();
        for pair in pairs {
            pair.borrow_mut().close(core);
        }
    }

    fn for_each_pair(
        &mut self,
        core: &mut Core,
        f: impl Fn(&mut TcpPair, &mut Core) -> io::Result<()>,
    ) -> io::Result<()> {
        let pairs: Vec<_> = self.roster.pairs.borrow().values().cloned().collect();
        for pair in pairs {
            let mut pair = pair.borrow_mut();
            f(&mut pair, core)?;
        }
        Ok(())
    }

    fn set_accepting(&mut self, core: &mut Core, accepting: bool) -> io::Result<()> {
        let desired = accepting.then_some(Interest::READABLE);
        core.set_interest(&mut self.listener, self.token, &mut self.registered, desired)
    }
}

impl EventHandler for TcpAcceptor {
    fn on_ready(&mut self, core: &mut Core, _token: Token, event: &Event) -> io::Result<()> {
        if event.is_readable() && !self.frozen {
            self.accept_ready(core);
        }
        Ok(())
    }

    fn on_control(&mut self, core: &mut Core, op: ControlOp) -> io::Result<()> {
        match op {
            ControlOp::Freeze => {
                if !self.frozen {
                    self.frozen = true;
                    self.set_accepting(core, false)?;
                }
                self.for_each_pair(core, |pair, core| pair.freeze(core))?;
                debug!(local = %self.local, "tcp crusher frozen");
                Ok(())
            }
            ControlOp::Unfreeze => {
                self.for_each_pair(core, |pair, core| pair.unfreeze(core))?;
                if self.frozen {
                    self.frozen = false;
                    self.set_accepting(core, true)?;
                }
                debug!(local = %self.local, "tcp crusher unfrozen");
                Ok(())
            }
            ControlOp::CloseSessions => {
                self.close_sessions(core);
                Ok(())
            }
            ControlOp::CloseSession(client_addr) => {
                let pair = self.roster.pairs.borrow().get(&client_addr).cloned();
                if let Some(pair) = pair {
                    pair.borrow_mut().close(core);
                }
                Ok(())
            }
            ControlOp::Snapshot(reply) => {
                let infos = self
                    .roster
                    .pairs
                    .borrow()
                    .values()
                    .map(|pair| pair.borrow().info())
                    .collect();
                let _ = reply.send(infos);
                Ok(())
            }
            ControlOp::SessionCount(reply) => {
                let _ = reply.send(self.roster.pairs.borrow().len());
                Ok(())
            }
            ControlOp::Shutdown => {
                self.set_accepting(core, false)?;
                self.close_sessions(core);
                core.remove_handler(self.token);
                debug!(local = %self.local, "tcp crusher closed");
                Ok(())
            }
            ControlOp::ConnectTimeout => Ok(()),
        }
    }
}

/// An accepted client socket waiting for its outbound connect to finish.
///
/// Registered WRITABLE on the upstream socket: mio signals connect
/// completion (or failure) as writability. The deadline task and the
/// completion callback cancel each other; whichever runs second finds
/// nothing to do.
struct PendingConnect {
    client_sock: Option<TcpStream>,
    upstream: Option<TcpStream>,
    token: Token,
    remote: SocketAddr,
    timeout: Option<Schedule>,
    buffer_count: usize,
    buffer_size: usize,
    roster: Rc<PairRoster>,
}

impl PendingConnect {
    fn abort(&mut self, core: &mut Core) {
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        if let Some(mut upstream) = self.upstream.take() {
            let _ = core.deregister_io(&mut upstream);
        }
        self.client_sock = None;
        core.remove_handler(self.token);
    }

    fn complete(&mut self, core: &mut Core) -> io::Result<()> {
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        core.remove_handler(self.token);

        let client_sock = self.client_sock.take().expect("pending client socket");
        let upstream = self.upstream.take().expect("pending upstream socket");

        let pair = TcpPair::spawn(
            core,
            &self.roster,
            client_sock,
            upstream,
            self.token,
            Some(Interest::WRITABLE),
            self.buffer_count,
            self.buffer_size,
        );

        match pair {
            Ok(pair) => {
                let info = pair.borrow().info();
                debug!(client = %info.client_addr, "pair created");
                self.roster
                    .pairs
                    .borrow_mut()
                    .insert(info.client_addr, pair);
                self.roster.notify(&self.roster.creation_listener, info);
                Ok(())
            }
            Err(e) => {
                // Sockets were consumed by the failed spawn and are gone.
                warn!(remote = %self.remote, error = %e, "pair construction failed");
                Ok(())
            }
        }
    }
}

impl EventHandler for PendingConnect {
    fn on_ready(&mut self, core: &mut Core, _token: Token, event: &Event) -> io::Result<()> {
        if !event.is_writable() {
            return Ok(());
        }
        let Some(upstream) = self.upstream.as_ref() else {
            return Ok(());
        };

        // take_error() then peer_addr() is the mio idiom for checking a
        // nonblocking connect.
        match upstream.take_error()? {
            Some(e) => {
                warn!(remote = %self.remote, error = %e, "outbound connect failed");
                counter!("netvice_tcp_connect_failures_total").increment(1);
                self.abort(core);
                Ok(())
            }
            None => match upstream.peer_addr() {
                Ok(_) => self.complete(core),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => {
                    warn!(remote = %self.remote, error = %e, "outbound connect failed");
                    counter!("netvice_tcp_connect_failures_total").increment(1);
                    self.abort(core);
                    Ok(())
                }
            },
        }
    }

    fn on_control(&mut self, core: &mut Core, op: ControlOp) -> io::Result<()> {
        match op {
            ControlOp::ConnectTimeout => {
                if self.upstream.is_some() {
                    warn!(remote = %self.remote, "outbound connect timed out");
                    counter!("netvice_tcp_connect_timeouts_total").increment(1);
                    self.abort(core);
                }
                Ok(())
            }
            ControlOp::Shutdown => {
                self.abort(core);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
