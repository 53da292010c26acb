//! Capability traits wrapping a raw bidirectional byte stream.
//!
//! The client and the server only ever talk to these traits, so the real
//! tokio sockets in [`tcp`] can be swapped for the deterministic double in
//! [`scripted`] without touching the engine.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::{Result, SocketError};

pub mod scripted;
pub mod tcp;

pub use scripted::{ScriptedAcceptor, ScriptedBinder, ScriptedTransport};
pub use tcp::{TcpAcceptor, TcpBinder, TcpTransport};

/// Transports are shared between the reader task that owns the read side,
/// the consumer that replies, and the liveness sweep.
pub type SharedTransport = Arc<dyn Transport>;

/// One live (or reconnectable) byte-stream connection.
///
/// All methods take `&self`: reads and writes are serialized independently
/// inside the implementation so a reply never waits behind a blocked read.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection. Fails if the transport was closed for good.
    async fn connect(&self, host: &str, port: u16) -> io::Result<()>;

    fn is_connected(&self) -> bool;

    /// Whether a usable stream is attached.
    fn has_stream(&self) -> bool;

    /// False before the stream is established and after it was torn down.
    fn can_read(&self) -> bool;

    /// False before the stream is established and after it was torn down.
    fn can_write(&self) -> bool;

    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer closed; the
    /// transport reports itself disconnected and unreadable afterwards.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole payload and flushes it.
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// [`Transport::write_all`] bounded by `timeout`. When the timeout fires
    /// the in-flight write is dropped and the write side is left in an
    /// undefined state.
    async fn send(&self, data: &[u8], timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.write_all(data)).await {
            Ok(result) => result.map_err(SocketError::from),
            Err(_) => Err(SocketError::SendTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Closes the stream but keeps the handle reusable for `connect`.
    async fn disconnect(&self) -> io::Result<()>;

    /// Releases the socket permanently.
    async fn close(&self);

    fn peer_address(&self) -> Option<SocketAddr>;
}

/// Source of accepted connections for the server.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Waits for the next incoming connection.
    ///
    /// `Err` means the listener is disposed; `Ok(None)` means the listener
    /// produced no connection. Both are fatal to the server using it.
    async fn accept(&self) -> io::Result<Option<SharedTransport>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stops listening. An accept already in flight is not interrupted.
    fn stop(&self);
}

/// Binds an [`Acceptor`] to a local address.
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn Acceptor>>;
}

/// Identity comparison for shared transports (data pointer only, vtables
/// may differ between codegen units).
pub fn same_transport(a: &SharedTransport, b: &SharedTransport) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_equal_contents() {
        let a: SharedTransport = Arc::new(ScriptedTransport::new());
        let b: SharedTransport = Arc::new(ScriptedTransport::new());
        let a_again = Arc::clone(&a);

        assert!(same_transport(&a, &a_again));
        assert!(!same_transport(&a, &b));
    }
}
