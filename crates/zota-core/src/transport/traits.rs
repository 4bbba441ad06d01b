//! Device command link abstraction.
//!
//! Defines the `OtaTransport` trait the engine talks through, allowing
//! different implementations (a real wireless link layer, mock, etc.).

use std::time::Duration;

use crate::protocol::{Incoming, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    RecvFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Abstract device-facing command link.
///
/// The engine depends only on this narrow contract; endpoint addressing,
/// command framing and the wireless link itself live behind it. A
/// [`TransportError::Timeout`] from `recv` is the waiter-expiry signal
/// the engine's state machine acts on.
pub trait OtaTransport: Send + Sync {
    /// Send a response or notification to the device, echoing the given
    /// transaction sequence number when replying to a request.
    fn send(&self, response: &Response, transaction_seq: Option<u8>)
    -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next device-initiated command.
    fn recv(&self, timeout: Duration) -> Result<Incoming, TransportError>;
}
