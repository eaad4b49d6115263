//! Socket construction and option plumbing.
//!
//! Sockets are built with `socket2` so options such as SO_RCVBUF and the
//! listen backlog can be applied before conversion into the nonblocking
//! `mio` types the reactor registers. UDP sockets are configured while
//! still blocking and switched nonblocking last; some options behave
//! differently on nonblocking sockets on some OSes.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

const DEFAULT_BACKLOG: i32 = 128;

/// Options applied to the listening socket and to both sockets of a pair.
#[derive(Debug, Clone)]
pub struct TcpSocketOptions {
    /// Listen backlog; 0 keeps the OS default.
    pub backlog: i32,
    pub keep_alive: bool,
    pub tcp_no_delay: bool,
    /// SO_RCVBUF in bytes; 0 keeps the OS default.
    pub rcv_buffer_size: usize,
    /// SO_SNDBUF in bytes; 0 keeps the OS default.
    pub snd_buffer_size: usize,
    /// Outbound connect deadline; zero disables the timeout.
    pub connection_timeout: Duration,
}

impl Default for TcpSocketOptions {
    fn default() -> Self {
        Self {
            backlog: 0,
            keep_alive: false,
            tcp_no_delay: false,
            rcv_buffer_size: 0,
            snd_buffer_size: 0,
            connection_timeout: Duration::ZERO,
        }
    }
}

/// Options applied to the inner and outer UDP sockets.
#[derive(Debug, Clone, Default)]
pub struct UdpSocketOptions {
    /// Socket family override; derived from the address when `None`.
    pub protocol_family: Option<Domain>,
    /// SO_RCVBUF in bytes; 0 keeps the OS default.
    pub rcv_buffer_size: usize,
    /// SO_SNDBUF in bytes; 0 keeps the OS default.
    pub snd_buffer_size: usize,
}

/// Binds the proxy's listening socket.
pub fn bind_tcp_listener(addr: SocketAddr, opts: &TcpSocketOptions) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if opts.rcv_buffer_size > 0 {
        socket.set_recv_buffer_size(opts.rcv_buffer_size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(if opts.backlog > 0 {
        opts.backlog
    } else {
        DEFAULT_BACKLOG
    })?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Applies per-stream options to an accepted or connecting socket.
pub fn apply_tcp_stream_options(stream: &TcpStream, opts: &TcpSocketOptions) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_keepalive(opts.keep_alive)?;
    sock.set_nodelay(opts.tcp_no_delay)?;
    if opts.rcv_buffer_size > 0 {
        sock.set_recv_buffer_size(opts.rcv_buffer_size)?;
    }
    if opts.snd_buffer_size > 0 {
        sock.set_send_buffer_size(opts.snd_buffer_size)?;
    }
    Ok(())
}

/// Starts a nonblocking outbound connect toward `remote`.
///
/// Completion (or failure) is signaled by a WRITE readiness event on the
/// returned stream.
pub fn connect_tcp(remote: SocketAddr, opts: &TcpSocketOptions) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(remote)?;
    apply_tcp_stream_options(&stream, opts)?;
    Ok(stream)
}

/// Binds the inner UDP socket. Returns the socket and the scratch buffer
/// size to use for receives (the effective OS receive buffer size).
pub fn bind_udp(addr: SocketAddr, opts: &UdpSocketOptions) -> io::Result<(UdpSocket, usize)> {
    let socket = new_udp_socket(addr, opts)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let scratch = socket.recv_buffer_size()?;
    Ok((UdpSocket::from_std(socket.into()), scratch))
}

/// Opens an outer UDP socket connected to `remote`.
pub fn connect_udp(remote: SocketAddr, opts: &UdpSocketOptions) -> io::Result<(UdpSocket, usize)> {
    let socket = new_udp_socket(remote, opts)?;
    socket.connect(&remote.into())?;
    socket.set_nonblocking(true)?;
    let scratch = socket.recv_buffer_size()?;
    Ok((UdpSocket::from_std(socket.into()), scratch))
}

fn new_udp_socket(addr: SocketAddr, opts: &UdpSocketOptions) -> io::Result<Socket> {
    let domain = opts.protocol_family.unwrap_or_else(|| Domain::for_address(addr));
    // Built blocking; options first, nonblocking last.
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if opts.rcv_buffer_size > 0 {
        socket.set_recv_buffer_size(opts.rcv_buffer_size)?;
    }
    if opts.snd_buffer_size > 0 {
        socket.set_send_buffer_size(opts.snd_buffer_size)?;
    }
    Ok(socket)
}
