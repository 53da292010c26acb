//! Connection bookkeeping shared by the accept loop, the reader tasks and
//! the liveness sweep.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use crate::transport::{same_transport, SharedTransport};

/// Opaque identifier minted once per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Binds an identifier to the transport it was minted for.
#[derive(Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub transport: SharedTransport,
}

impl ConnectionRecord {
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.transport.peer_address()
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("peer", &self.peer_address())
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

/// Map from identifier to record. Holds at most one record per transport.
pub struct ConnectionRegistry {
    records: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the record for `transport`, minting and inserting one if the
    /// transport is unknown. The flag is true when a record was created.
    pub fn register(&self, transport: &SharedTransport) -> (ConnectionRecord, bool) {
        let mut records = self.records();
        if let Some(existing) = records
            .values()
            .find(|record| same_transport(&record.transport, transport))
        {
            return (existing.clone(), false);
        }

        let record = ConnectionRecord {
            id: self.next_id(),
            transport: SharedTransport::clone(transport),
        };
        records.insert(record.id, record.clone());
        (record, true)
    }

    pub fn find(&self, transport: &SharedTransport) -> Option<ConnectionRecord> {
        self.records()
            .values()
            .find(|record| same_transport(&record.transport, transport))
            .cloned()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.records().get(&id).cloned()
    }

    /// Every live record, ordered by identifier.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.records().remove(&id)
    }

    /// Drops every record whose transport reports not connected and hands
    /// them back, ordered by identifier, so the caller can release them.
    pub fn remove_disconnected(&self) -> Vec<ConnectionRecord> {
        let mut removed = Vec::new();
        self.records().retain(|_, record| {
            if record.transport.is_connected() {
                true
            } else {
                removed.push(record.clone());
                false
            }
        });
        removed.sort_by_key(|record| record.id);
        removed
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::{ScriptedTransport, Transport};

    fn live(port: u16) -> (Arc<ScriptedTransport>, SharedTransport) {
        let scripted = Arc::new(ScriptedTransport::connected(SocketAddr::from((
            [127, 0, 0, 1],
            port,
        ))));
        let shared: SharedTransport = scripted.clone();
        (scripted, shared)
    }

    #[test]
    fn registering_the_same_transport_twice_keeps_one_record() {
        let registry = ConnectionRegistry::new();
        let (_, transport) = live(5000);

        let (first, created) = registry.register(&transport);
        assert!(created);
        let (second, created_again) = registry.register(&transport);
        assert!(!created_again);

        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_transports_get_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let (_, a) = live(5001);
        let (_, b) = live(5002);

        let (a_record, _) = registry.register(&a);
        let (b_record, _) = registry.register(&b);

        assert_ne!(a_record.id, b_record.id);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].id < snapshot[1].id);
    }

    #[test]
    fn removal_only_touches_disconnected_records() {
        let registry = ConnectionRegistry::new();
        let (alive, alive_shared) = live(6000);
        let (dead, dead_shared) = live(6001);
        let (_, other_shared) = live(6002);

        let (alive_record, _) = registry.register(&alive_shared);
        let (dead_record, _) = registry.register(&dead_shared);
        registry.register(&other_shared);

        dead.drop_connection();
        let removed = registry.remove_disconnected();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, dead_record.id);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(alive_record.id).is_some());
        assert!(registry.find(&dead_shared).is_none());
        assert!(alive.is_connected());
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let registry = ConnectionRegistry::new();
        let (_, first) = live(7000);
        let (first_record, _) = registry.register(&first);
        registry.remove(first_record.id);

        let (_, second) = live(7001);
        let (second_record, _) = registry.register(&second);
        assert_ne!(first_record.id, second_record.id);
    }
}
