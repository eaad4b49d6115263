//! The TCP crusher facade: a controllable proxy in front of one remote.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use mio::Token;
use tracing::debug;

use crate::error::CrusherError;
use crate::reactor::{ControlOp, Handle, Reactor};
use crate::sockopt::TcpSocketOptions;
use crate::tcp::acceptor::TcpAcceptor;
use crate::tcp::pair::{PairInfo, PairListener, PairRoster};

const DEFAULT_BUFFER_COUNT: usize = 16;
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

struct LifeState {
    open: bool,
    frozen: bool,
    acceptor: Option<Token>,
    bound: Option<SocketAddr>,
}

/// A TCP proxy for test purposes: relays every connection to one remote
/// and can freeze, unfreeze, or crush all traffic on demand.
///
/// ```no_run
/// use netvice::{Reactor, TcpCrusherBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let reactor = Reactor::new()?;
/// let crusher = TcpCrusherBuilder::new()
///     .with_local_address("127.0.0.1:10080".parse()?)
///     .with_remote_address("127.0.0.1:8080".parse()?)
///     .with_reactor(&reactor)
///     .build_and_open()?;
///
/// // run some traffic through 127.0.0.1:10080, then sever it:
/// crusher.crush()?;
///
/// crusher.close()?;
/// # Ok(())
/// # }
/// ```
pub struct TcpCrusher {
    handle: Handle,
    local: SocketAddr,
    remote: SocketAddr,
    opts: TcpSocketOptions,
    buffer_count: usize,
    buffer_size: usize,
    creation_listener: Option<PairListener>,
    deletion_listener: Option<PairListener>,
    state: Mutex<LifeState>,
}

impl TcpCrusher {
    /// Binds the listening socket and starts accepting.
    ///
    /// Errors if the proxy is already open or the bind fails.
    pub fn open(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        self.open_locked(&mut state, self.local)
    }

    /// Closes every pair and the listening socket. No-op when closed.
    pub fn close(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        self.close_locked(&mut state)
    }

    /// Closes and reopens the proxy in place, severing every live pair
    /// while keeping the configuration.
    pub fn crush(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        // Rebind to the address actually in use so a port-0 bind keeps
        // its port across the crush.
        let local = state.bound.unwrap_or(self.local);
        debug!(local = %local, "tcp crusher crushing");
        self.close_locked(&mut state)?;
        self.open_locked(&mut state, local)
    }

    /// Suspends all I/O: the acceptor and every pair lose their interest
    /// sets; sockets and buffered bytes stay intact. No-op when closed.
    pub fn freeze(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            debug!(local = %self.local, "freeze on a closed crusher ignored");
            return Ok(());
        }
        self.control(&state, ControlOp::Freeze)?;
        state.frozen = true;
        Ok(())
    }

    /// Resumes I/O after [`freeze`](Self::freeze); buffered bytes flow
    /// again in order.
    pub fn unfreeze(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        self.control(&state, ControlOp::Unfreeze)?;
        state.frozen = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    /// Errors when the proxy is not open.
    pub fn is_frozen(&self) -> Result<bool, CrusherError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        Ok(state.frozen)
    }

    /// The address the proxy listens on. While open this is the actually
    /// bound address (relevant for port-0 binds); otherwise the
    /// configured one.
    pub fn local_addr(&self) -> SocketAddr {
        self.state.lock().unwrap().bound.unwrap_or(self.local)
    }

    /// The remote address every connection is relayed to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Snapshot of all live pairs with their byte counters.
    pub fn pairs(&self) -> Result<Vec<PairInfo>, CrusherError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        let (tx, rx) = mpsc::channel();
        self.control(&state, ControlOp::Snapshot(tx))?;
        rx.recv().map_err(|_| CrusherError::ReactorGone)
    }

    /// Closes all live pairs but keeps accepting new connections.
    pub fn close_all_pairs(&self) -> Result<(), CrusherError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        self.control(&state, ControlOp::CloseSessions)
    }

    /// Closes the single pair keyed by `client_addr`, if it is live.
    pub fn close_pair(&self, client_addr: SocketAddr) -> Result<(), CrusherError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        self.control(&state, ControlOp::CloseSession(client_addr))
    }

    fn open_locked(&self, state: &mut LifeState, local: SocketAddr) -> Result<(), CrusherError> {
        if state.open {
            return Err(CrusherError::State("crusher is already open"));
        }

        let handle = self.handle.clone();
        let remote = self.remote;
        let opts = self.opts.clone();
        let buffer_count = self.buffer_count;
        let buffer_size = self.buffer_size;
        let creation_listener = self.creation_listener.clone();
        let deletion_listener = self.deletion_listener.clone();

        let (token, bound) = self.handle.call(move |core| {
            let roster = Rc::new(PairRoster {
                pairs: RefCell::new(HashMap::new()),
                creation_listener,
                deletion_listener,
                handle: handle.clone(),
            });
            TcpAcceptor::spawn(
                core,
                handle,
                local,
                remote,
                opts,
                buffer_count,
                buffer_size,
                roster,
            )
        })??;

        state.open = true;
        state.frozen = false;
        state.acceptor = Some(token);
        state.bound = Some(bound);
        debug!(local = %bound, remote = %self.remote, "tcp crusher open");
        Ok(())
    }

    fn close_locked(&self, state: &mut LifeState) -> Result<(), CrusherError> {
        if !state.open {
            return Ok(());
        }
        self.control(state, ControlOp::Shutdown)?;
        state.open = false;
        state.frozen = false;
        state.acceptor = None;
        state.bound = None;
        Ok(())
    }

    /// Routes a control operation to the acceptor on the reactor thread
    /// and waits for it to be applied.
    fn control(&self, state: &LifeState, op: ControlOp) -> Result<(), CrusherError> {
        let token = state
            .acceptor
            .ok_or(CrusherError::State("crusher is not open"))?;
        self.handle
            .call(move |core| match core.handler(token) {
                Some(handler) => handler.borrow_mut().on_control(core, op),
                None => Ok(()),
            })?
            .map_err(CrusherError::Io)
    }
}

impl Drop for TcpCrusher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Builder for [`TcpCrusher`]. Local address, remote address, and reactor
/// are required; everything else has defaults.
#[derive(Default)]
pub struct TcpCrusherBuilder {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    handle: Option<Handle>,
    opts: TcpSocketOptions,
    buffer_count: Option<usize>,
    buffer_size: Option<usize>,
    creation_listener: Option<PairListener>,
    deletion_listener: Option<PairListener>,
}

impl TcpCrusherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the proxy binds its listening socket.
    pub fn with_local_address(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    /// Where every accepted connection is relayed to.
    pub fn with_remote_address(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr);
        self
    }

    /// The reactor that will run this proxy.
    pub fn with_reactor(mut self, reactor: &Reactor) -> Self {
        self.handle = Some(reactor.handle());
        self
    }

    /// Listen backlog; the OS default when unset.
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.opts.backlog = backlog;
        self
    }

    /// SO_KEEPALIVE for both sockets of every pair.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.opts.keep_alive = keep_alive;
        self
    }

    /// TCP_NODELAY for both sockets of every pair.
    pub fn with_tcp_no_delay(mut self, tcp_no_delay: bool) -> Self {
        self.opts.tcp_no_delay = tcp_no_delay;
        self
    }

    /// SO_RCVBUF in bytes; the OS default when unset.
    pub fn with_rcv_buffer_size(mut self, size: usize) -> Self {
        self.opts.rcv_buffer_size = size;
        self
    }

    /// SO_SNDBUF in bytes; the OS default when unset.
    pub fn with_snd_buffer_size(mut self, size: usize) -> Self {
        self.opts.snd_buffer_size = size;
        self
    }

    /// Deadline for the outbound connect; zero (the default) disables it.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connection_timeout = timeout;
        self
    }

    /// How many buffers sit in the queue between the two sockets of a
    /// pair. Default 16.
    pub fn with_buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = Some(count);
        self
    }

    /// Size of each queue buffer in bytes. Default 16 KiB.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Called on the reactor thread once for every pair created. The
    /// callback must not invoke lifecycle operations on the crusher.
    pub fn with_creation_listener(
        mut self,
        listener: impl Fn(&PairInfo) + Send + Sync + 'static,
    ) -> Self {
        self.creation_listener = Some(std::sync::Arc::new(listener));
        self
    }

    /// Called on the reactor thread once for every pair deleted. The
    /// callback must not invoke lifecycle operations on the crusher.
    pub fn with_deletion_listener(
        mut self,
        listener: impl Fn(&PairInfo) + Send + Sync + 'static,
    ) -> Self {
        self.deletion_listener = Some(std::sync::Arc::new(listener));
        self
    }

    /// Validates the configuration and builds the crusher, still closed.
    pub fn build(self) -> Result<TcpCrusher, CrusherError> {
        let local = self.local.ok_or(CrusherError::Config("local address is not set"))?;
        let remote = self
            .remote
            .ok_or(CrusherError::Config("remote address is not set"))?;
        let handle = self.handle.ok_or(CrusherError::Config("reactor is not set"))?;

        Ok(TcpCrusher {
            handle,
            local,
            remote,
            opts: self.opts,
            buffer_count: self.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT),
            buffer_size: self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            creation_listener: self.creation_listener,
            deletion_listener: self.deletion_listener,
            state: Mutex::new(LifeState {
                open: false,
                frozen: false,
                acceptor: None,
                bound: None,
            }),
        })
    }

    /// Builds the crusher and opens it immediately.
    pub fn build_and_open(self) -> Result<TcpCrusher, CrusherError> {
        let crusher = self.build()?;
        crusher.open()?;
        Ok(crusher)
    }
}
