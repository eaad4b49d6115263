//! UDP proxying: per-source virtual connections with idle expiry.

mod crusher;
mod inner;
mod outer;
mod queue;

pub use self::crusher::{DatagramCrusher, DatagramCrusherBuilder};
pub use self::queue::{DatagramMessage, DatagramQueue, PENDING_BYTES_LIMIT, PENDING_LIMIT};
