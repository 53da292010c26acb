//! Error taxonomy shared by the client, the server and the framing code.

use std::io;

/// Result type alias using [`SocketError`].
pub type Result<T> = std::result::Result<T, SocketError>;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// A caller supplied an argument the engine cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The listen address could not be parsed as an IP address.
    #[error("the IP specified is not valid: {0:?}")]
    InvalidAddress(String),

    /// Framing parameters rejected before any read takes place.
    #[error("invalid framing configuration: {0}")]
    InvalidFraming(String),

    #[error(
        "the socket could not start reading; check that the peer allows it \
         and that the connection was initialized correctly"
    )]
    NotReadable,

    /// The transport is not connected, has no stream or is not writable.
    #[error("unsupported transport state: {0}")]
    UnsupportedState(String),

    #[error("timeout of {timeout_ms} ms trying to send the data")]
    SendTimeout { timeout_ms: u64 },

    #[error("timeout of {timeout_ms} ms waiting for data")]
    ReceiveTimeout { timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fatal to the server instance: the listener can no longer accept.
    #[error("the server has stopped listening or was not initialized correctly: {0}")]
    ListenerDisposed(#[source] io::Error),

    /// Fatal to the server instance: the listener produced no connection.
    #[error("the listener returned no connection")]
    NullConnection,

    /// The operation is not valid in the server's current lifecycle state.
    #[error("operation `{operation}` is not valid while the server is {state}")]
    InvalidLifecycle {
        operation: &'static str,
        state: &'static str,
    },
}

impl SocketError {
    /// True for failures that only concern one connection or one call, as
    /// opposed to configuration mistakes or a dead listener.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SocketError::NotReadable
                | SocketError::UnsupportedState(_)
                | SocketError::SendTimeout { .. }
                | SocketError::ReceiveTimeout { .. }
                | SocketError::Io(_)
        )
    }
}
