//! The UDP crusher facade.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use mio::Token;
use socket2::Domain;
use tracing::debug;

use crate::datagram::inner::DatagramInner;
use crate::error::CrusherError;
use crate::reactor::{ControlOp, Handle, Reactor};
use crate::sockopt::UdpSocketOptions;

struct LifeState {
    open: bool,
    frozen: bool,
    inner: Option<Token>,
    bound: Option<SocketAddr>,
}

/// A UDP proxy for test purposes: every datagram from a client source is
/// forwarded to one remote through a per-source upstream socket, and
/// replies are routed back to the source that earned them.
///
/// ```no_run
/// use netvice::{DatagramCrusherBuilder, Reactor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let reactor = Reactor::new()?;
/// let crusher = DatagramCrusherBuilder::new()
///     .with_local_address("127.0.0.1:10081".parse()?)
///     .with_remote_address("127.0.0.1:5353".parse()?)
///     .with_reactor(&reactor)
///     .build_and_open()?;
///
/// // run some datagrams through 127.0.0.1:10081, then sever the flows:
/// crusher.crush()?;
///
/// crusher.close()?;
/// # Ok(())
/// # }
/// ```
pub struct DatagramCrusher {
    handle: Handle,
    local: SocketAddr,
    remote: SocketAddr,
    opts: UdpSocketOptions,
    max_idle: Duration,
    state: Mutex<LifeState>,
}

impl DatagramCrusher {
    /// Binds the local socket and starts relaying.
    pub fn open(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        self.open_locked(&mut state, self.local)
    }

    /// Closes the local socket and every outer. No-op when closed.
    pub fn close(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        self.close_locked(&mut state)
    }

    /// Closes and reopens in place, destroying every virtual connection.
    pub fn crush(&self) -> Result<(), CrusherError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        let local = state.bound.unwrap_or(self.local);
        debug!(local = %local, "datagram crusher crushing");
        self.close_locked(&mut state)?;
        self.open_locked(&mut state, local)
    }

    /// Suspends all packet movement; sockets and queues stay intact.
    /// No-op when closed.
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

    /// Resumes packet movement after [`freeze`](Self::freeze).
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

    /// The address the proxy receives on; the actually bound address
    /// while open.
    pub fn local_addr(&self) -> SocketAddr {
        self.state.lock().unwrap().bound.unwrap_or(self.local)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Number of live virtual connections (one per observed source).
    pub fn virtual_connections(&self) -> Result<usize, CrusherError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(CrusherError::State("crusher is not open"));
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.control(&state, ControlOp::SessionCount(tx))?;
        rx.recv().map_err(|_| CrusherError::ReactorGone)
    }

    fn open_locked(&self, state: &mut LifeState, local: SocketAddr) -> Result<(), CrusherError> {
        if state.open {
            return Err(CrusherError::State("crusher is already open"));
        }

        let remote = self.remote;
        let opts = self.opts.clone();
        let max_idle = self.max_idle;
        let (token, bound) = self
            .handle
            .call(move |core| DatagramInner::spawn(core, local, remote, opts, max_idle))??;

        state.open = true;
        state.frozen = false;
        state.inner = Some(token);
        state.bound = Some(bound);
        debug!(local = %bound, remote = %self.remote, "datagram crusher open");
        Ok(())
    }

    fn close_locked(&self, state: &mut LifeState) -> Result<(), CrusherError> {
        if !state.open {
            return Ok(());
        }
        self.control(state, ControlOp::Shutdown)?;
        state.open = false;
        state.frozen = false;
        state.inner = None;
        state.bound = None;
        Ok(())
    }

    fn control(&self, state: &LifeState, op: ControlOp) -> Result<(), CrusherError> {
        let token = state
            .inner
            .ok_or(CrusherError::State("crusher is not open"))?;
        self.handle
            .call(move |core| match core.handler(token) {
                Some(handler) => handler.borrow_mut().on_control(core, op),
                None => Ok(()),
            })?
            .map_err(CrusherError::Io)
    }
}

impl Drop for DatagramCrusher {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Builder for [`DatagramCrusher`]. Local address, remote address, and
/// reactor are required.
#[derive(Default)]
pub struct DatagramCrusherBuilder {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    handle: Option<Handle>,
    opts: UdpSocketOptions,
    max_idle: Duration,
}

impl DatagramCrusherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the proxy binds its receiving socket.
    pub fn with_local_address(mut self, addr: SocketAddr) -> Self {
        self.local = Some(addr);
        self
    }

    /// Where client datagrams are forwarded to.
    pub fn with_remote_address(mut self, addr: SocketAddr) -> Self {
        self.remote = Some(addr);
        self
    }

    /// The reactor that will run this proxy.
    pub fn with_reactor(mut self, reactor: &Reactor) -> Self {
        self.handle = Some(reactor.handle());
        self
    }

    /// Socket family for all sockets; derived from the addresses when
    /// unset.
    pub fn with_protocol_family(mut self, family: Domain) -> Self {
        self.opts.protocol_family = Some(family);
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

    /// Evict outers idle longer than this on each new source; zero (the
    /// default) disables the sweep.
    pub fn with_max_idle_duration(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Validates the configuration and builds the crusher, still closed.
    pub fn build(self) -> Result<DatagramCrusher, CrusherError> {
        let local = self.local.ok_or(CrusherError::Config("local address is not set"))?;
        let remote = self
            .remote
            .ok_or(CrusherError::Config("remote address is not set"))?;
        let handle = self.handle.ok_or(CrusherError::Config("reactor is not set"))?;

        Ok(DatagramCrusher {
            handle,
            local,
            remote,
            opts: self.opts,
            max_idle: self.max_idle,
            state: Mutex::new(LifeState {
                open: false,
                frozen: false,
                inner: None,
                bound: None,
            }),
        })
    }

    /// Builds the crusher and opens it immediately.
    pub fn build_and_open(self) -> Result<DatagramCrusher, CrusherError> {
        let crusher = self.build()?;
        crusher.open()?;
        Ok(crusher)
    }
}
