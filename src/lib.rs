//! A controllable TCP/UDP man-in-the-middle proxy for tests.
//!
//! `netvice` sits between a client and a server so a test harness can
//! pause traffic on demand (freeze/unfreeze), forcibly tear down and
//! rebuild all in-flight connections (crush), and observe every live
//! flow. It consists of:
//!
//! - [`reactor`]: Single-threaded readiness loop driving all I/O
//! - [`tcp`]: Stream proxying through bounded buffer queues
//! - [`datagram`]: Packet proxying with per-source virtual connections
//! - [`sockopt`]: Socket construction and option plumbing
//! - [`error`]: The error taxonomy surfaced to callers
//!
//! ```no_run
//! use netvice::{Reactor, TcpCrusherBuilder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reactor = Reactor::new()?;
//! let crusher = TcpCrusherBuilder::new()
//!     .with_local_address("127.0.0.1:10080".parse()?)
//!     .with_remote_address("127.0.0.1:80".parse()?)
//!     .with_reactor(&reactor)
//!     .build_and_open()?;
//!
//! // exercise the system under test through 127.0.0.1:10080 ...
//! crusher.freeze()?;   // hold all bytes in place
//! crusher.unfreeze()?; // let them flow again
//! crusher.crush()?;    // sever every connection, start fresh
//! # Ok(())
//! # }
//! ```

pub mod datagram;
pub mod error;
pub mod reactor;
pub mod sockopt;
pub mod tcp;

pub use crate::datagram::{DatagramCrusher, DatagramCrusherBuilder};
pub use crate::error::CrusherError;
pub use crate::reactor::{Handle, Reactor};
pub use crate::tcp::{PairInfo, TcpCrusher, TcpCrusherBuilder};
