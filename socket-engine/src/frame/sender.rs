//! Timed writes of a single payload.

use std::time::Duration;

use crate::{
    error::{Result, SocketError},
    transport::Transport,
};

/// Writes `payload` to `transport` and flushes it within `timeout`.
///
/// A timed-out send leaves the write side in an undefined state; callers
/// should treat the connection as suspect. Nothing is retried.
pub async fn send_frame(
    payload: &[u8],
    transport: &dyn Transport,
    timeout: Duration,
) -> Result<()> {
    if !transport.is_connected() {
        return Err(SocketError::UnsupportedState(
            "the transport is not connected".into(),
        ));
    }
    if !transport.has_stream() {
        return Err(SocketError::UnsupportedState(
            "the network stream to send data is not initialized".into(),
        ));
    }
    if !transport.can_write() {
        return Err(SocketError::UnsupportedState(
            "the network stream is not writable".into(),
        ));
    }

    transport.send(payload, timeout).await
}
