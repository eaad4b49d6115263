//! A bridged TCP session: two sockets, two directional transfers, one
//! cooperative close state machine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};

use metrics::{counter, gauge};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::reactor::{ControlOp, Core, EventHandler, Handle};
use crate::tcp::transfer::{DrainStop, ReadStop, TcpTransfer};

/// Which socket of the pair an event or operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum End {
    /// The accepted client socket.
    Inner,
    /// The socket connected to the remote.
    Outer,
}

impl End {
    fn opposite(self) -> End {
        match self {
            End::Inner => End::Outer,
            End::Outer => End::Inner,
        }
    }

    fn label(self) -> &'static str {
        match self {
            End::Inner => "inner",
            End::Outer => "outer",
        }
    }
}

/// Snapshot of one live (or just-closed) pair, as handed to listeners and
/// returned by [`TcpCrusher::pairs`](crate::tcp::TcpCrusher::pairs).
#[derive(Debug, Clone)]
pub struct PairInfo {
    /// The accepted client's address; unique per live pair and used as
    /// the pair key.
    pub client_addr: SocketAddr,
    /// Local address of the accepted socket (the proxy's listen side).
    pub listen_addr: SocketAddr,
    /// Local address of the socket connected to the remote.
    pub outer_local_addr: SocketAddr,
    /// The remote address.
    pub outer_remote_addr: SocketAddr,
    /// Bytes relayed from client to remote so far.
    pub bytes_inner_to_outer: u64,
    /// Bytes relayed from remote to client so far.
    pub bytes_outer_to_inner: u64,
}

/// Listener callback type for pair creation and deletion.
pub type PairListener = std::sync::Arc<dyn Fn(&PairInfo) + Send + Sync>;

/// State shared between the acceptor and its pairs: the registry of live
/// pairs plus the observer callbacks.
pub(crate) struct PairRoster {
    pub(crate) pairs: RefCell<HashMap<SocketAddr, Rc<RefCell<TcpPair>>>>,
    pub(crate) creation_listener: Option<PairListener>,
    pub(crate) deletion_listener: Option<PairListener>,
    pub(crate) handle: Handle,
}

impl PairRoster {
    /// Posts a listener invocation onto the reactor task queue so observer
    /// latency never stalls the I/O loop.
    pub(crate) fn notify(&self, listener: &Option<PairListener>, info: PairInfo) {
        if let Some(listener) = listener {
            let listener = std::sync::Arc::clone(listener);
            let _ = self.handle.execute(move |_core| listener(&info));
        }
    }
}

struct Side {
    sock: Option<TcpStream>,
    token: Token,
    registered: Option<Interest>,
    /// This end's peer closed its write half; nothing more to read here.
    read_eof: bool,
    /// We forwarded that close to this end with a write-half shutdown.
    fin_sent: bool,
}

impl Side {
    /// The direction sourced at this end is complete: EOF seen and every
    /// buffered byte drained into the peer.
    fn direction_done(&self, outgoing_empty: bool) -> bool {
        self.read_eof && outgoing_empty
    }
}

/// Two sockets bridged back-to-back through two bounded queues.
///
/// Half-close propagates cooperatively: EOF on one end stops that
/// direction, drains its residue, then forwards the close as a write-half
/// shutdown on the peer while the reverse direction keeps flowing. The
/// pair reaches CLOSED once both directions are complete, or immediately
/// on any I/O error or external close.
pub(crate) struct TcpPair {
    info: PairInfo,
    closed: bool,
    frozen: bool,
    inner: Side,
    outer: Side,
    /// Reads the inner socket, drains into the outer socket.
    in_to_out: TcpTransfer,
    /// Reads the outer socket, drains into the inner socket.
    out_to_in: TcpTransfer,
    roster: Weak<PairRoster>,
}

impl TcpPair {
    /// Builds a pair over two connected sockets and registers both ends
    /// with READ interest.
    ///
    /// `outer_registered` carries the interest the outer socket was
    /// registered with while its connect was pending, so activation
    /// re-registers instead of double-registering.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        core: &mut Core,
        roster: &Rc<PairRoster>,
        inner_sock: TcpStream,
        outer_sock: TcpStream,
        outer_token: Token,
        outer_registered: Option<Interest>,
        buffer_count: usize,
        buffer_size: usize,
    ) -> io::Result<Rc<RefCell<TcpPair>>> {
        let info = PairInfo {
            client_addr: inner_sock.peer_addr()?,
            listen_addr: inner_sock.local_addr()?,
            outer_local_addr: outer_sock.local_addr()?,
            outer_remote_addr: outer_sock.peer_addr()?,
            bytes_inner_to_outer: 0,
            bytes_outer_to_inner: 0,
        };

        let inner_token = core.next_token();
        let pair = Rc::new(RefCell::new(TcpPair {
            info,
            closed: false,
            frozen: false,
            inner: Side {
                sock: Some(inner_sock),
                token: inner_token,
                registered: None,
                read_eof: false,
                fin_sent: false,
            },
            outer: Side {
                sock: Some(outer_sock),
                token: outer_token,
                registered: outer_registered,
                read_eof: false,
                fin_sent: false,
            },
            in_to_out: TcpTransfer::new("inner->outer", buffer_count, buffer_size),
            out_to_in: TcpTransfer::new("outer->inner", buffer_count, buffer_size),
            roster: Rc::downgrade(roster),
        }));

        {
            let mut p = pair.borrow_mut();
            p.apply_interest(core, End::Inner)?;
            p.apply_interest(core, End::Outer)?;
        }

        core.insert_handler(inner_token, pair.clone());
        core.insert_handler(outer_token, pair.clone());

        counter!("netvice_tcp_pairs_total").increment(1);
        gauge!("netvice_tcp_pairs_active").increment(1.0);

        Ok(pair)
    }

    pub(crate) fn info(&self) -> PairInfo {
        let mut info = self.info.clone();
        info.bytes_inner_to_outer = self.in_to_out.total_bytes();
        info.bytes_outer_to_inner = self.out_to_in.total_bytes();
        info
    }

    fn side(&mut self, end: End) -> &mut Side {
        match end {
            End::Inner => &mut self.inner,
            End::Outer => &mut self.outer,
        }
    }

    /// The transfer whose source is `end`.
    fn outgoing(&mut self, end: End) -> &mut TcpTransfer {
        match end {
            End::Inner => &mut self.in_to_out,
            End::Outer => &mut self.out_to_in,
        }
    }

    fn end_of(&self, token: Token) -> Option<End> {
        if token == self.inner.token {
            Some(End::Inner)
        } else if token == self.outer.token {
            Some(End::Outer)
        } else {
            None
        }
    }

    /// Recomputes the interest set for `end` from current queue and state
    /// conditions and reconciles the OS registration.
    ///
    /// READ while the end is unfrozen, pre-EOF, and its outgoing queue
    /// has space; WRITE while unfrozen and bytes destined for this end
    /// are pending. This one place enforces the full backpressure
    /// protocol.
    fn apply_interest(&mut self, core: &mut Core, end: End) -> io::Result<()> {
        let read = !self.frozen
            && !self.closed
            && !self.side(end).read_eof
            && self.outgoing(end).queue().has_space();
        let write = !self.frozen
            && !self.closed
            && self.outgoing(end.opposite()).queue().pending_bytes() > 0;

        let desired = match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let side = self.side(end);
        if let Some(sock) = side.sock.as_mut() {
            core.set_interest(sock, side.token, &mut side.registered, desired)?;
        }
        Ok(())
    }

    fn handle_readable(&mut self, core: &mut Core, end: End) -> io::Result<()> {
        if self.side(end).read_eof {
            return Ok(());
        }
        let Some(mut sock) = self.side(end).sock.take() else {
            return Ok(());
        };
        let result = self.outgoing(end).read_from(&mut sock);
        self.side(end).sock = Some(sock);

        match result {
            Ok((_, ReadStop::Eof)) => {
                trace!(pair = %self.info.client_addr, end = end.label(), "eof");
                self.side(end).read_eof = true;
                self.finish_direction(core, end);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    pair = %self.info.client_addr,
                    end = end.label(),
                    error = %e,
                    "read failed"
                );
                self.close(core);
                Ok(())
            }
        }
    }

    fn handle_writable(&mut self, core: &mut Core, end: End) -> io::Result<()> {
        let Some(mut sock) = self.side(end).sock.take() else {
            return Ok(());
        };
        // The queue drained into this end is owned by the opposite
        // transfer.
        let result = self.outgoing(end.opposite()).drain_into(&mut sock);
        self.side(end).sock = Some(sock);

        match result {
            Ok((_, DrainStop::Empty)) => {
                self.finish_direction(core, end.opposite());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    pair = %self.info.client_addr,
                    end = end.label(),
                    error = %e,
                    "write failed"
                );
                self.close(core);
                Ok(())
            }
        }
    }

    /// Called whenever the direction sourced at `src` may have completed:
    /// its EOF is propagated to the sink once the residue is drained, and
    /// the pair closes once both directions are done.
    fn finish_direction(&mut self, core: &mut Core, src: End) {
        if self.closed {
            return;
        }

        let outgoing_empty = self.outgoing(src).queue().is_empty();
        if !self.side(src).direction_done(outgoing_empty) {
            return;
        }

        let sink = src.opposite();
        if !self.side(sink).fin_sent {
            self.side(sink).fin_sent = true;
            trace!(pair = %self.info.client_addr, end = sink.label(), "fin forwarded");
            let shut = match self.side(sink).sock.as_ref() {
                Some(sock) => sock.shutdown(Shutdown::Write),
                None => Ok(()),
            };
            if let Err(e) = shut {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!(pair = %self.info.client_addr, error = %e, "shutdown failed");
                    self.close(core);
                    return;
                }
            }
        }

        let inner_done = self.inner.read_eof && self.in_to_out.queue().is_empty();
        let outer_done = self.outer.read_eof && self.out_to_in.queue().is_empty();
        if inner_done && outer_done {
            self.close(core);
        }
    }

    /// Deregisters and closes one socket.
    fn drop_socket(&mut self, core: &mut Core, end: End) {
        let side = self.side(end);
        if let Some(mut sock) = side.sock.take() {
            if side.registered.take().is_some() {
                let _ = core.deregister_io(&mut sock);
            }
        }
        core.remove_handler(self.side(end).token);
    }

    /// Moves the pair to CLOSED: both sockets closed and deregistered,
    /// the roster entry removed, the deletion listener notified.
    /// Idempotent.
    pub(crate) fn close(&mut self, core: &mut Core) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.drop_socket(core, End::Inner);
        self.drop_socket(core, End::Outer);

        if let Some(roster) = self.roster.upgrade() {
            roster.pairs.borrow_mut().remove(&self.info.client_addr);
            roster.notify(&roster.deletion_listener, self.info());
        }

        gauge!("netvice_tcp_pairs_active").decrement(1.0);
        debug!(pair = %self.info.client_addr, "pair closed");
    }

    /// Clears all interest on both ends, leaving buffers intact.
    pub(crate) fn freeze(&mut self, core: &mut Core) -> io::Result<()> {
        if !self.frozen {
            self.frozen = true;
            self.apply_interest(core, End::Inner)?;
            self.apply_interest(core, End::Outer)?;
        }
        Ok(())
    }

    /// Restores READ on both ends and WRITE where output is pending.
    pub(crate) fn unfreeze(&mut self, core: &mut Core) -> io::Result<()> {
        if self.frozen {
            self.frozen = false;
            self.apply_interest(core, End::Inner)?;
            self.apply_interest(core, End::Outer)?;
        }
        Ok(())
    }
}

impl EventHandler for TcpPair {
    fn on_ready(&mut self, core: &mut Core, token: Token, event: &Event) -> io::Result<()> {
        let Some(end) = self.end_of(token) else {
            return Ok(());
        };

        if event.is_readable() && !self.closed {
            self.handle_readable(core, end)?;
        }

        if event.is_writable() && !self.closed {
            self.handle_writable(core, end)?;
        }

        if !self.closed {
            self.apply_interest(core, End::Inner)?;
            self.apply_interest(core, End::Outer)?;
        }

        Ok(())
    }

    fn on_control(&mut self, core: &mut Core, op: ControlOp) -> io::Result<()> {
        match op {
            ControlOp::Freeze => self.freeze(core),
            ControlOp::Unfreeze => self.unfreeze(core),
            ControlOp::Shutdown => {
                self.close(core);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
