use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use socket_engine::{
    server::{ConnectionId, InboundFrame, ServerConfig, SocketServer},
    transport::{Binder, TcpBinder},
};
use tokio::{select, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    command::{CommandHandler, WELCOME},
    session::SessionManager,
};

/// Ping written to every connection by the liveness sweep.
const PING: &[u8] = b" ";

pub struct SumServer {
    engine: Arc<SocketServer>,
    sessions: Arc<SessionManager>,
    handler: Arc<CommandHandler>,
    sweep_interval: Duration,
}

impl SumServer {
    /// Builds an engine over `binder` that pings with [`PING`] and reads
    /// whatever bytes arrive. Nothing is bound until [`SumServer::listen`].
    pub fn new(binder: Arc<dyn Binder>, sweep_interval: Duration) -> Result<Self> {
        let config = ServerConfig {
            ping_payload: PING.to_vec(),
            ..ServerConfig::default()
        };
        let engine = Arc::new(SocketServer::with_config(binder, config));
        engine
            .set_reader_bytes()
            .context("failed to configure the frame reader")?;
        let sessions = Arc::new(SessionManager::new());
        Ok(Self {
            engine,
            handler: Arc::new(CommandHandler::new(Arc::clone(&sessions))),
            sessions,
            sweep_interval,
        })
    }

    /// Binds a TCP engine on `ip:port`.
    pub async fn bind(ip: &str, port: u16, sweep_interval: Duration) -> Result<Self> {
        let server = Self::new(Arc::new(TcpBinder::new()), sweep_interval)?;
        server.listen(ip, port).await?;
        Ok(server)
    }

    pub async fn listen(&self, ip: &str, port: u16) -> Result<()> {
        self.engine
            .initialize(ip, port)
            .await
            .with_context(|| format!("failed to listen on {ip}:{port}"))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.local_addr()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let SumServer {
            engine,
            sessions,
            handler,
            sweep_interval,
        } = self;
        tokio::pin!(shutdown);

        let listener: JoinHandle<socket_engine::Result<()>> = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.start_listening().await }
        });
        let dispatcher = Dispatcher::new(Arc::clone(&engine), sessions, handler);
        let sweeper = spawn_sweeper(dispatcher.clone(), sweep_interval);
        info!(local_addr = ?engine.local_addr(), "server started");

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                frame = engine.next_frame() => match frame {
                    Some(frame) => dispatcher.dispatch(frame),
                    None => break,
                },
            }
        }

        engine.close_server();
        sweeper.abort();
        listener.await.context("accept loop panicked")??;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_sweeper(dispatcher: Dispatcher, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            for record in dispatcher.engine.check_connections().await {
                dispatcher.retire(record.id);
            }
            debug!(sessions = dispatcher.sessions.len(), "liveness sweep done");
        }
    })
}

type Workers = HashMap<ConnectionId, mpsc::UnboundedSender<InboundFrame>>;

/// Routes frames to one worker task per connection, so a connection's
/// frames are handled one at a time and in arrival order.
#[derive(Clone)]
struct Dispatcher {
    engine: Arc<SocketServer>,
    sessions: Arc<SessionManager>,
    handler: Arc<CommandHandler>,
    workers: Arc<Mutex<Workers>>,
}

impl Dispatcher {
    fn new(
        engine: Arc<SocketServer>,
        sessions: Arc<SessionManager>,
        handler: Arc<CommandHandler>,
    ) -> Self {
        Self {
            engine,
            sessions,
            handler,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn dispatch(&self, frame: InboundFrame) {
        let id = frame.id;
        let mut workers = self.workers();
        let frame = match workers.get(&id) {
            Some(worker) => match worker.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };

        let (worker, frames) = mpsc::unbounded_channel();
        if worker.send(frame).is_ok() {
            workers.insert(id, worker);
            self.spawn_worker(id, frames);
        }
    }

    /// Forgets a swept connection. Its worker finishes the frames already
    /// queued and exits.
    fn retire(&self, id: ConnectionId) {
        self.sessions.remove(id);
        self.workers().remove(&id);
    }

    fn spawn_worker(&self, id: ConnectionId, mut frames: mpsc::UnboundedReceiver<InboundFrame>) {
        let engine = Arc::clone(&self.engine);
        let sessions = Arc::clone(&self.sessions);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match handle_frame(frame, &engine, &sessions, &handler).await {
                    Ok(()) => {}
                    Err(err) if err.is_transient() => {
                        warn!(%id, error = %err, "failed to answer client")
                    }
                    Err(err) => error!(%id, error = %err, "reply rejected"),
                }
            }
            debug!(%id, "connection worker finished");
        });
    }

    fn workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn handle_frame(
    frame: InboundFrame,
    engine: &SocketServer,
    sessions: &SessionManager,
    handler: &CommandHandler,
) -> socket_engine::Result<()> {
    let ip = frame
        .transport
        .peer_address()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (session, is_new) = sessions.is_new_connection(frame.id, &ip);
    let reply = if is_new {
        info!(id = %frame.id, %ip, "new user connected");
        WELCOME.to_string()
    } else {
        let line = frame.text();
        if line == "\r\n" {
            return Ok(());
        }
        handler.handle(&session, &line)
    };

    engine
        .response_text_to_client(&frame.transport, &format!("{reply}\r\n"))
        .await
}
