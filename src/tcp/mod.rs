//! TCP proxying: acceptor, bridged pairs, bounded transfer queues.

mod acceptor;
mod crusher;
mod pair;
mod queue;
mod transfer;

pub use self::crusher::{TcpCrusher, TcpCrusherBuilder};
pub use self::pair::{PairInfo, PairListener};
pub use self::queue::TransferQueue;
