//! Error types surfaced by the crusher facades.
//!
//! Only configuration and lifecycle problems reach the caller; per-flow I/O
//! failures are handled on the reactor thread and observable through the
//! deletion listener.

use std::io;

use thiserror::Error;

/// Errors returned by the public crusher API.
#[derive(Debug, Error)]
pub enum CrusherError {
    /// A required builder setting is missing or invalid.
    #[error("configuration: {0}")]
    Config(&'static str),

    /// The operation needs the proxy in a different lifecycle state.
    #[error("illegal state: {0}")]
    State(&'static str),

    /// An I/O error while opening or closing the proxy (bind, register).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The reactor thread has shut down while an operation was in flight.
    #[error("reactor is gone")]
    ReactorGone,
}
