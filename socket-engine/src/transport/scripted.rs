//! In-memory transport and listener doubles.
//!
//! `ScriptedTransport` replays byte chunks exactly as queued (one chunk per
//! read, split only when the reader's buffer is smaller), records every
//! write, and can simulate a stalled peer or a vanished one. Once its script
//! runs dry it behaves like a peer that closed, unless it is held open.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use super::{Acceptor, Binder, SharedTransport, Transport};

pub struct ScriptedTransport {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    arrivals: Notify,
    peer: Mutex<Option<SocketAddr>>,
    attached: AtomicBool,
    connected: AtomicBool,
    readable: AtomicBool,
    writable: AtomicBool,
    closed: AtomicBool,
    held_open: AtomicBool,
    stalled_writes: AtomicBool,
    refuses_connect: AtomicBool,
    teardown: watch::Sender<bool>,
}

impl ScriptedTransport {
    /// An unconnected double; `connect` succeeds unless refused.
    pub fn new() -> Self {
        let (teardown, _) = watch::channel(false);
        Self {
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
            peer: Mutex::new(None),
            attached: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            readable: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            held_open: AtomicBool::new(false),
            stalled_writes: AtomicBool::new(false),
            refuses_connect: AtomicBool::new(false),
            teardown,
        }
    }

    /// A double that is already connected to `peer`, as if accepted.
    pub fn connected(peer: SocketAddr) -> Self {
        let transport = Self::new();
        *lock(&transport.peer) = Some(peer);
        transport.set_live(true);
        transport
    }

    /// Queues chunks, each delivered by one read.
    pub fn with_chunks<I, C>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        lock(&self.inbound).extend(chunks.into_iter().map(Into::into));
        self
    }

    /// Keeps the peer "connected" once the script is exhausted: reads wait
    /// for [`ScriptedTransport::push_chunk`] instead of reporting a close.
    pub fn held_open(self) -> Self {
        self.held_open.store(true, Ordering::SeqCst);
        self
    }

    /// Makes every later `connect` fail with `ConnectionRefused`.
    pub fn refusing_connect(self) -> Self {
        self.refuses_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn push_chunk(&self, chunk: impl Into<Vec<u8>>) {
        lock(&self.inbound).push_back(chunk.into());
        self.arrivals.notify_waiters();
    }

    /// The peer closes after the remaining queued chunks are consumed.
    pub fn finish(&self) {
        self.held_open.store(false, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }

    /// Writes never complete from now on.
    pub fn stall_writes(&self) {
        self.stalled_writes.store(true, Ordering::SeqCst);
    }

    /// The peer vanishes without a FIN: the transport reports itself
    /// disconnected and later writes fail.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
    }

    /// Every payload written so far, one entry per write.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    /// Every byte written so far, concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.written).concat()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
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

    fn next_chunk(&self, capacity: usize) -> Option<Vec<u8>> {
        let mut inbound = lock(&self.inbound);
        let mut chunk = inbound.pop_front()?;
        if chunk.len() > capacity {
            let rest = chunk.split_off(capacity);
            inbound.push_front(rest);
        }
        Some(chunk)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport was closed and cannot be reused",
            ));
        }
        if self.refuses_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted refusal",
            ));
        }
        self.teardown.send_replace(false);
        self.set_live(true);
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
        if !self.has_stream() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no stream attached",
            ));
        }

        let mut signal = self.teardown.subscribe();
        loop {
            let arrived = self.arrivals.notified();

            if let Some(chunk) = self.next_chunk(buf.len()) {
                buf[..chunk.len()].copy_from_slice(&chunk);
                return Ok(chunk.len());
            }
            if !self.held_open.load(Ordering::SeqCst) || *signal.borrow_and_update() {
                self.mark_peer_gone();
                return Ok(0);
            }

            tokio::select! {
                _ = arrived => {}
                _ = signal.changed() => {}
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.stalled_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.can_write() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted peer is gone",
            ));
        }
        lock(&self.written).push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> io::Result<()> {
        self.teardown.send_replace(true);
        self.set_live(false);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.disconnect().await;
    }

    fn peer_address(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }
}

enum Incoming {
    Connection(SharedTransport),
    Null,
}

/// Listener double fed by the test through [`ScriptedAcceptor::offer`].
pub struct ScriptedAcceptor {
    incoming: Mutex<VecDeque<Incoming>>,
    arrivals: Notify,
    stopped: AtomicBool,
    local_addr: Mutex<SocketAddr>,
}

impl ScriptedAcceptor {
    fn new() -> Self {
        Self {
            incoming: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
            stopped: AtomicBool::new(false),
            local_addr: Mutex::new(SocketAddr::from(([127, 0, 0, 1], 0))),
        }
    }

    /// Hands a connection to the next `accept`.
    pub fn offer(&self, transport: SharedTransport) {
        lock(&self.incoming).push_back(Incoming::Connection(transport));
        self.arrivals.notify_waiters();
    }

    /// Makes the next `accept` return no connection.
    pub fn offer_null(&self) {
        lock(&self.incoming).push_back(Incoming::Null);
        self.arrivals.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acceptor for ScriptedAcceptor {
    async fn accept(&self) -> io::Result<Option<SharedTransport>> {
        loop {
            let arrived = self.arrivals.notified();

            if self.stopped.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener disposed",
                ));
            }
            match lock(&self.incoming).pop_front() {
                Some(Incoming::Connection(transport)) => return Ok(Some(transport)),
                Some(Incoming::Null) => return Ok(None),
                None => {}
            }

            arrived.await;
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(*lock(&self.local_addr))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }
}

/// Binder double that always hands out the same [`ScriptedAcceptor`].
#[derive(Clone)]
pub struct ScriptedBinder {
    acceptor: Arc<ScriptedAcceptor>,
}

impl ScriptedBinder {
    pub fn new() -> Self {
        Self {
            acceptor: Arc::new(ScriptedAcceptor::new()),
        }
    }

    pub fn acceptor(&self) -> Arc<ScriptedAcceptor> {
        Arc::clone(&self.acceptor)
    }
}

impl Default for ScriptedBinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Binder for ScriptedBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Arc<dyn Acceptor>> {
        *lock(&self.acceptor.local_addr) = addr;
        let acceptor: Arc<dyn Acceptor> = self.acceptor.clone();
        Ok(acceptor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn peer() -> SocketAddr {
        "10.0.0.7:4000".parse().expect("addr")
    }

    #[tokio::test]
    async fn replays_chunks_then_reports_close() {
        let transport =
            ScriptedTransport::connected(peer()).with_chunks([b"ab".to_vec(), b"cde".to_vec()]);
        let mut buf = [0u8; 8];

        assert_eq!(transport.read(&mut buf).await.expect("read"), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(transport.read(&mut buf).await.expect("read"), 3);
        assert_eq!(&buf[..3], b"cde");
        assert_eq!(transport.read(&mut buf).await.expect("read"), 0);
        assert!(!transport.is_connected());
        assert!(!transport.can_read());
    }

    #[tokio::test]
    async fn oversized_chunk_is_split_across_reads() {
        let transport = ScriptedTransport::connected(peer()).with_chunks([b"abcdef".to_vec()]);
        let mut buf = [0u8; 4];

        assert_eq!(transport.read(&mut buf).await.expect("read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(transport.read(&mut buf).await.expect("read"), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn held_open_transport_waits_for_pushed_chunks() {
        let transport = Arc::new(ScriptedTransport::connected(peer()).held_open());
        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let n = transport.read(&mut buf).await.expect("read");
                buf[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_chunk(b"late".to_vec());

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader finishes")
            .expect("join");
        assert_eq!(got, b"late");
    }

    #[tokio::test]
    async fn writes_are_recorded_until_the_peer_drops() {
        let transport = ScriptedTransport::connected(peer());
        transport.write_all(b"one").await.expect("write");
        transport.write_all(b"two").await.expect("write");
        assert_eq!(transport.writes(), vec![b"one".to_vec(), b"two".to_vec()]);

        transport.drop_connection();
        assert!(!transport.is_connected());
        assert!(transport.write_all(b"three").await.is_err());
        assert_eq!(transport.written_bytes(), b"onetwo");
    }

    #[tokio::test]
    async fn acceptor_hands_out_offers_in_order() {
        let binder = ScriptedBinder::new();
        let acceptor = binder.bind(peer()).await.expect("bind");
        let scripted = binder.acceptor();

        let first: SharedTransport = Arc::new(ScriptedTransport::connected(peer()));
        scripted.offer(Arc::clone(&first));
        scripted.offer_null();

        let accepted = acceptor.accept().await.expect("accept").expect("connection");
        assert!(crate::transport::same_transport(&accepted, &first));
        assert!(acceptor.accept().await.expect("accept").is_none());

        acceptor.stop();
        assert!(acceptor.accept().await.is_err());
        assert_eq!(acceptor.local_addr().expect("addr"), peer());
    }
}
