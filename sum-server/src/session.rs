//! Per-connection accumulators, keyed by the engine's connection id.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use socket_engine::ConnectionId;
use tracing::info;

pub struct Session {
    id: ConnectionId,
    ip: String,
    commands: Mutex<Vec<i32>>,
}

impl Session {
    pub fn new(id: ConnectionId, ip: impl Into<String>) -> Self {
        Self {
            id,
            ip: ip.into(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    fn commands(&self) -> MutexGuard<'_, Vec<i32>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, value: i32) {
        self.commands().push(value);
    }

    /// The running sum, or `None` once it no longer fits in an `i32`.
    pub fn sum(&self) -> Option<i32> {
        let total: i64 = self.commands().iter().map(|&n| i64::from(n)).sum();
        i32::try_from(total).ok()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sum = self.sum().unwrap_or(i32::MAX);
        write!(f, "IP: {} Sum: {}", self.ip, sum)
    }
}

/// Sessions in the order their connections first spoke.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the session for `id`, creating it when absent. The flag is
    /// true when this call created it.
    pub fn is_new_connection(&self, id: ConnectionId, ip: &str) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.iter().find(|session| session.id == id) {
            return (Arc::clone(existing), false);
        }

        let session = Arc::new(Session::new(id, ip));
        sessions.push(Arc::clone(&session));
        info!(%id, ip, "session added");
        (session, true)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions();
        let index = sessions.iter().position(|session| session.id == id)?;
        let session = sessions.remove(index);
        info!(%id, ip = session.ip(), "connection closed");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Every session rendered as `IP: <ip> Sum: <sum>`, in insertion order.
    pub fn render_all(&self) -> Vec<String> {
        self.sessions().iter().map(ToString::to_string).collect()
    }
}
