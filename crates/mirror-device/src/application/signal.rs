//! Outbound signaling seam.
//!
//! The engine never writes to a socket directly.  Each session is given a
//! [`SignalSink`] at accept time; the WebSocket server implements it by
//! queueing text frames for the connection's writer task.

use mirror_core::{OutboundMessage, ProtocolError};
use thiserror::Error;

/// Errors raised while sending a message to a controller.
#[derive(Debug, Error, PartialEq)]
pub enum SendError {
    /// The connection's writer is gone.
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Per-connection outbound message sink.
///
/// `send` must not block: it is called while the session's lock is held.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}
