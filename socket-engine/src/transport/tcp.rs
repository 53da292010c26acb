//! Tokio-backed transport, listener and binder.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{watch, Mutex},
};
use tracing::debug;

use super::{Acceptor, Binder, SharedTransport, Transport};

/// A TCP connection split into independently locked halves.
///
/// The read half is held by whoever is reading (normally one reader task);
/// writes only contend with other writes. `disconnect`/`close` raise a
/// teardown signal so a read blocked on an idle peer returns `Ok(0)`.
pub struct TcpTransport {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    peer: StdMutex<Option<SocketAddr>>,
    attached: AtomicBool,
    connected: AtomicBool,
    readable: AtomicBool,
    writable: AtomicBool,
    closed: AtomicBool,
    teardown: watch::Sender<bool>,
}

impl TcpTransport {
    /// An unconnected transport, ready for [`Transport::connect`].
    pub fn new() -> Self {
        let (teardown, _) = watch::channel(false);
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            peer: StdMutex::new(None),
            attached: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            readable: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            teardown,
        }
    }

    /// Wraps a stream that is already connected, e.g. one from `accept`.
    pub fn from_stream(stream: TcpStream) -> Self {
        let mut transport = Self::new();
        transport.peer = StdMutex::new(stream.peer_addr().ok());
        let (read_half, write_half) = stream.into_split();
        transport.reader = Mutex::new(Some(read_half));
        transport.writer = Mutex::new(Some(write_half));
        transport.set_live(true);
        transport
    }

    fn set_live(&self, live: bool) {
        self.attached.store(live, Ordering::SeqCst);
        self.connected.store(live, Ordering::SeqCst);
        self.readable.store(live, Ordering::SeqCst);
        self.writable.store(live, Ordering::SeqCst);
    }

    fn mark_peer_gone(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.readable.store(false, Ordering::SeqCst);
    }

    fn mark_write_failed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

// Resolves once the teardown flag is raised. Never resolves otherwise.
async fn torn_down(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport was closed and cannot be reused",
            ));
        }

        let stream = TcpStream::connect((host, port)).await?;
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = peer;
        self.teardown.send_replace(false);
        self.set_live(true);

        debug!(?peer, "transport connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn has_stream(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn can_read(&self) -> bool {
        self.attached.load(Ordering::SeqCst) && self.readable.load(Ordering::SeqCst)
    }

    fn can_write(&self) -> bool {
        self.attached.load(Ordering::SeqCst) && self.writable.load(Ordering::SeqCst)
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut signal = self.teardown.subscribe();
        let mut guard = self.reader.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream attached",
            ));
        };

        let read = tokio::select! {
            biased;
            _ = torn_down(&mut signal) => Ok(0),
            read = half.read(buf) => read,
        };

        match read {
            Ok(0) => {
                self.mark_peer_gone();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.mark_peer_gone();
                Err(err)
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream attached",
            ));
        };

        let written = async {
            half.write_all(data).await?;
            half.flush().await
        }
        .await;

        if written.is_err() {
            self.mark_write_failed();
        }
        written
    }

    async fn disconnect(&self) -> io::Result<()> {
        self.teardown.send_replace(true);
        self.set_live(false);

        let writer = self.writer.lock().await.take();
        if let Some(mut half) = writer {
            if let Err(error) = half.shutdown().await {
                debug!(?error, "write half did not shut down cleanly");
            }
        }
        self.reader.lock().await.take();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.disconnect().await;
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listener wrapper whose `stop` disposes the socket for later accepts.
pub struct TcpAcceptor {
    listener: StdMutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: StdMutex::new(Some(Arc::new(listener))),
            local_addr,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> io::Result<Option<SharedTransport>> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(listener) = listener else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener disposed",
            ));
        };

        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        let transport: SharedTransport = Arc::new(TcpTransport::from_stream(stream));
        Ok(Some(transport))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn stop(&self) {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Binds real tokio listeners.
#[derive(Debug, Clone, Default)]
pub struct TcpBinder;

impl TcpBinder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Binder for TcpBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn Acceptor>> {
        let listener = TcpListener::bind(addr).await?;
        let acceptor: Arc<dyn Acceptor> = Arc::new(TcpAcceptor::new(listener)?);
        Ok(acceptor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    async fn connected_pair() -> (Arc<TcpTransport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let client = Arc::new(TcpTransport::new());
        let (connected, accepted) =
            tokio::join!(client.connect("127.0.0.1", port), listener.accept());
        connected.expect("connect");
        let (peer, _) = accepted.expect("accept");
        (client, peer)
    }

    #[tokio::test]
    async fn fresh_transport_reports_nothing_usable() {
        let transport = TcpTransport::new();
        assert!(!transport.is_connected());
        assert!(!transport.has_stream());
        assert!(!transport.can_read());
        assert!(!transport.can_write());
        assert!(transport.peer_address().is_none());
    }

    #[tokio::test]
    async fn peer_close_marks_transport_dead() {
        let (client, peer) = connected_pair().await;
        assert!(client.is_connected());
        drop(peer);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("read should finish")
            .expect("read");
        assert_eq!(n, 0);
        assert!(!client.is_connected());
        assert!(!client.can_read());
    }

    #[tokio::test]
    async fn disconnect_releases_a_blocked_read() {
        let (client, _peer) = connected_pair().await;
        let reader = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                client.read(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        client.disconnect().await.expect("disconnect");

        let n = timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should be released")
            .expect("join")
            .expect("read");
        assert_eq!(n, 0);
        assert!(!client.has_stream());
    }

    #[tokio::test]
    async fn closed_transport_cannot_reconnect() {
        let (client, _peer) = connected_pair().await;
        client.close().await;
        let err = client
            .connect("127.0.0.1", 1)
            .await
            .expect_err("closed transport must refuse to connect");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn stopped_acceptor_reports_disposed() {
        let acceptor = TcpBinder::new()
            .bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        acceptor.stop();
        let err = acceptor.accept().await.err().expect("accept after stop");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
