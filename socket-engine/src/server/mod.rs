//! Multi-client server: accept loop, one reader task per connection, the
//! shared registry and inbound queue, and the liveness sweep.
//!
//! Stopping is cooperative. [`SocketServer::close_server`] raises a watch
//! signal that the accept loop and every reader task race against their
//! pending I/O, and disposes the listener. An accept or read that already
//! completed when the signal lands is still processed once.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use tokio::{select, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SocketError},
    frame::{encode_ascii, send_frame, Framing, DEFAULT_BUFFER_SIZE},
    transport::{Acceptor, Binder, SharedTransport, TcpBinder},
};

pub mod queue;
pub mod registry;

pub use queue::{InboundFrame, InboundQueue};
pub use registry::{ConnectionId, ConnectionRecord, ConnectionRegistry};

/// Tunables that apply to every connection of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Upper bound for replies and liveness pings.
    pub response_timeout: Duration,
    /// Payload written to every connection by [`SocketServer::check_connections`].
    pub ping_payload: Vec<u8>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            ping_payload: Vec::new(),
        }
    }
}

/// Where a server is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initialized,
    Listening,
    Stopped,
}

impl ServerState {
    fn name(self) -> &'static str {
        match self {
            ServerState::Uninitialized => "uninitialized",
            ServerState::Initialized => "initialized",
            ServerState::Listening => "listening",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Lifecycle {
    Uninitialized,
    Initialized(Arc<dyn Acceptor>),
    Listening(Arc<dyn Acceptor>),
    Stopped,
}

impl Lifecycle {
    fn state(&self) -> ServerState {
        match self {
            Lifecycle::Uninitialized => ServerState::Uninitialized,
            Lifecycle::Initialized(_) => ServerState::Initialized,
            Lifecycle::Listening(_) => ServerState::Listening,
            Lifecycle::Stopped => ServerState::Stopped,
        }
    }
}

/// State touched by the reader tasks. The registry and the queue lock
/// independently and are never held together.
struct Connections {
    registry: ConnectionRegistry,
    queue: InboundQueue,
    current: Mutex<Option<ConnectionRecord>>,
}

impl Connections {
    fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            queue: InboundQueue::new(),
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<ConnectionRecord>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SocketServer {
    binder: Arc<dyn Binder>,
    config: ServerConfig,
    lifecycle: Mutex<Lifecycle>,
    framing: Mutex<Framing>,
    endpoint: OnceLock<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
    connections: Arc<Connections>,
    shutdown: watch::Sender<bool>,
}

impl SocketServer {
    pub fn new(binder: Arc<dyn Binder>) -> Self {
        Self::with_config(binder, ServerConfig::default())
    }

    pub fn with_config(binder: Arc<dyn Binder>, config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            binder,
            config,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            framing: Mutex::new(Framing::default()),
            endpoint: OnceLock::new(),
            local_addr: OnceLock::new(),
            connections: Arc::new(Connections::new()),
            shutdown,
        }
    }

    /// A server that binds real TCP listeners.
    pub fn tcp() -> Self {
        Self::new(Arc::new(TcpBinder::new()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn framing_guard(&self) -> MutexGuard<'_, Framing> {
        self.framing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state()
    }

    /// Parses `ip` and binds the listener. Valid once per server.
    pub async fn initialize(&self, ip: &str, port: u16) -> Result<()> {
        let state = self.state();
        if state != ServerState::Uninitialized {
            return Err(invalid_lifecycle("initialize", state));
        }

        let address: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| SocketError::InvalidAddress(ip.to_string()))?;
        let endpoint = SocketAddr::new(address, port);
        let acceptor = self.binder.bind(endpoint).await?;
        let local_addr = acceptor.local_addr()?;

        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Uninitialized) {
            acceptor.stop();
            return Err(invalid_lifecycle("initialize", lifecycle.state()));
        }
        *lifecycle = Lifecycle::Initialized(acceptor);
        let _ = self.endpoint.set(endpoint);
        let _ = self.local_addr.set(local_addr);

        info!(%endpoint, %local_addr, "server initialized");
        Ok(())
    }

    /// The address passed to `initialize`.
    pub fn ip(&self) -> Option<IpAddr> {
        self.endpoint.get().map(SocketAddr::ip)
    }

    /// The port passed to `initialize`.
    pub fn port(&self) -> Option<u16> {
        self.endpoint.get().map(SocketAddr::port)
    }

    /// The address actually bound, which differs from `port()` when it was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Runs the accept loop until the server is closed (`Ok`) or the
    /// listener fails fatally (`Err`, after which the server is stopped).
    pub async fn start_listening(&self) -> Result<()> {
        let (acceptor, framing) = {
            let mut lifecycle = self.lifecycle();
            let acceptor = match &*lifecycle {
                Lifecycle::Initialized(acceptor) => Arc::clone(acceptor),
                other => return Err(invalid_lifecycle("start_listening", other.state())),
            };
            *lifecycle = Lifecycle::Listening(Arc::clone(&acceptor));
            (acceptor, self.framing_guard().clone())
        };

        let mut shutdown = self.shutdown.subscribe();
        info!(local_addr = ?self.local_addr(), %framing, "server listening");

        let outcome = loop {
            let accepted = select! {
                biased;
                _ = stopped(&mut shutdown) => break Ok(()),
                accepted = acceptor.accept() => accepted,
            };

            match accepted {
                Ok(Some(transport)) => self.spawn_reader(transport, framing.clone()),
                Ok(None) => break Err(SocketError::NullConnection),
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = ?err, "failed to accept connection");
                }
                Err(err) => break Err(SocketError::ListenerDisposed(err)),
            }
        };

        match &outcome {
            Ok(()) => info!("accept loop finished"),
            Err(err) => {
                error!(error = %err, "accept loop failed, server can no longer accept");
                self.stop();
            }
        }
        outcome
    }

    fn spawn_reader(&self, transport: SharedTransport, framing: Framing) {
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown.subscribe();
        let peer = transport.peer_address();
        tokio::spawn(async move {
            match read_frames(transport, framing, connections, shutdown).await {
                Ok(()) => debug!(?peer, "reader stopped with the server"),
                Err(SocketError::NotReadable) => info!(?peer, "peer closed the connection"),
                Err(err) => warn!(?peer, error = %err, "reader terminated"),
            }
        });
    }

    /// Signals every task to stop, disposes the listener and moves to
    /// `Stopped`. Idempotent.
    pub fn close_server(&self) {
        if self.stop() {
            info!("server closed");
        }
    }

    fn stop(&self) -> bool {
        self.shutdown.send_replace(true);
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Initialized(acceptor) | Lifecycle::Listening(acceptor) => {
                acceptor.stop();
                true
            }
            Lifecycle::Uninitialized => true,
            Lifecycle::Stopped => false,
        }
    }

    pub fn set_reader(&self, framing: Framing) -> Result<()> {
        framing.validate()?;
        let lifecycle = self.lifecycle();
        match lifecycle.state() {
            ServerState::Uninitialized | ServerState::Initialized => {
                debug!(%framing, "reader configured");
                *self.framing_guard() = framing;
                Ok(())
            }
            state => Err(invalid_lifecycle("set_reader", state)),
        }
    }

    /// Buffer-until-idle with the default 1024-byte buffer.
    pub fn set_reader_bytes(&self) -> Result<()> {
        self.set_reader_buffer_bytes(DEFAULT_BUFFER_SIZE)
    }

    pub fn set_reader_buffer_bytes(&self, buffer_size: usize) -> Result<()> {
        self.set_reader(Framing::BufferUntilIdle { buffer_size })
    }

    pub fn set_reader_number_of_bytes(&self, buffer_size: usize, length: usize) -> Result<()> {
        self.set_reader(Framing::FixedLength {
            buffer_size,
            length,
        })
    }

    pub fn set_reader_delimiters(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.set_reader(Framing::DelimitedBothEnds {
            start: start.to_vec(),
            end: end.to_vec(),
        })
    }

    pub fn set_reader_end_delimiter(&self, end: &[u8]) -> Result<()> {
        self.set_reader(Framing::DelimitedEndOnly { end: end.to_vec() })
    }

    pub fn framing(&self) -> Framing {
        self.framing_guard().clone()
    }

    /// True while the inbound queue holds at least one frame.
    pub fn is_new_data(&self) -> bool {
        !self.connections.queue.is_empty()
    }

    /// Dequeues the oldest frame.
    pub fn get_data(&self) -> Option<InboundFrame> {
        self.connections.queue.pop()
    }

    /// Waits for the next frame. Returns `None` once the server is stopped.
    pub async fn next_frame(&self) -> Option<InboundFrame> {
        let mut shutdown = self.shutdown.subscribe();
        select! {
            biased;
            _ = stopped(&mut shutdown) => None,
            frame = self.connections.queue.next() => Some(frame),
        }
    }

    pub fn get_clients(&self) -> Vec<ConnectionRecord> {
        self.connections.registry.snapshot()
    }

    /// The connection whose frame was enqueued last, by any reader task.
    pub fn get_current_client(&self) -> Option<ConnectionRecord> {
        self.connections.current().clone()
    }

    pub fn get_current_client_id(&self) -> Option<ConnectionId> {
        self.connections.current().as_ref().map(|record| record.id)
    }

    /// Sends `payload` to `transport`, bounded by the response timeout.
    pub async fn response_to_client(
        &self,
        transport: &SharedTransport,
        payload: &[u8],
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(SocketError::InvalidArgument(
                "the response payload can not be empty".into(),
            ));
        }
        send_frame(payload, transport.as_ref(), self.config.response_timeout).await
    }

    pub async fn response_text_to_client(
        &self,
        transport: &SharedTransport,
        text: &str,
    ) -> Result<()> {
        self.response_to_client(transport, &encode_ascii(text)).await
    }

    /// Liveness sweep: pings every registered connection, then removes and
    /// closes every one that reports disconnected. Returns the removed
    /// records.
    pub async fn check_connections(&self) -> Vec<ConnectionRecord> {
        let records = self.connections.registry.snapshot();
        let ping = self.config.ping_payload.as_slice();
        let timeout = self.config.response_timeout;

        join_all(records.iter().map(|record| async move {
            if let Err(err) = send_frame(ping, record.transport.as_ref(), timeout).await {
                warn!(
                    id = %record.id,
                    peer = ?record.peer_address(),
                    error = %err,
                    "liveness ping failed"
                );
            }
        }))
        .await;

        let removed = self.connections.registry.remove_disconnected();
        for record in &removed {
            record.transport.close().await;
            info!(id = %record.id, peer = ?record.peer_address(), "removed dead connection");
        }
        if !removed.is_empty() {
            debug!(
                removed = removed.len(),
                remaining = self.connections.registry.len(),
                "liveness sweep finished"
            );
        }
        removed
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn read_frames(
    transport: SharedTransport,
    framing: Framing,
    connections: Arc<Connections>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (record, created) = connections.registry.register(&transport);
    if created {
        info!(id = %record.id, peer = ?record.peer_address(), "connection registered");
    }

    loop {
        let payload = select! {
            biased;
            _ = stopped(&mut shutdown) => return Ok(()),
            payload = framing.read_frame(transport.as_ref()) => payload?,
        };
        // Closed peer: the next read reports NotReadable.
        if payload.is_empty() && !transport.can_read() {
            continue;
        }

        debug!(id = %record.id, len = payload.len(), "frame received");
        *connections.current() = Some(record.clone());
        connections.queue.push(InboundFrame {
            id: record.id,
            transport: SharedTransport::clone(&transport),
            payload,
        });
    }
}

// Resolves once the stop flag is raised or the server is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

fn invalid_lifecycle(operation: &'static str, state: ServerState) -> SocketError {
    SocketError::InvalidLifecycle {
        operation,
        state: state.name(),
    }
}
