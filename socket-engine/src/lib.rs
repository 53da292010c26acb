//! TCP socket engine: a multi-client server and a matching client with
//! selectable message framing over a raw byte stream.
//!
//! - [`transport`] wraps byte-stream connections behind capability traits,
//!   with tokio sockets for real use and a scripted double for tests.
//! - [`frame`] holds the four framing strategies and the timed sender.
//! - [`client`] connects one transport and exposes send/receive calls.
//! - [`server`] runs the accept loop and per-connection reader tasks, keeps
//!   the connection registry and the inbound FIFO queue, and performs the
//!   liveness sweep.
//! - [`error`] is the shared error taxonomy.
//!
//! Integration tests drive the server through the scripted binder and over
//! loopback TCP.

pub mod client;
pub mod error;
pub mod frame;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, SocketClient};
pub use error::{Result, SocketError};
pub use frame::Framing;
pub use server::{
    ConnectionId, ConnectionRecord, InboundFrame, ServerConfig, ServerState, SocketServer,
};
pub use transport::{Acceptor, Binder, SharedTransport, Transport};
