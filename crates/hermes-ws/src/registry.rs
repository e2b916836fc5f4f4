//! The client registry.
//!
//! A concurrency-safe table of live connections keyed by [`ClientId`]. Every
//! connection task inserts and removes its own entry; the outbound API and
//! shutdown read it through point-in-time snapshots, so nothing ever iterates
//! the live map while other tasks mutate it.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::connection::{ClientConnection, ClientId};
use crate::error::{WsError, WsResult};

/// A registered connection as returned by lookups and snapshots.
#[derive(Clone)]
pub struct RegisteredClient {
    /// The client's id.
    pub id: ClientId,
    /// The connection handle.
    pub connection: Arc<dyn ClientConnection>,
    /// When the entry was inserted.
    pub connected_at: Instant,
    seq: u64,
}

impl fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("id", &self.id)
            .field("state", &self.connection.state())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Statistics about the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Entries currently registered.
    pub active: usize,
    /// Entries ever inserted.
    pub total_registered: usize,
    /// Inserts refused (duplicate id, capacity, or closed registry).
    pub total_rejected: usize,
    /// Entries removed, individually or by `clear`.
    pub total_removed: usize,
}

/// Concurrency-safe mapping from [`ClientId`] to connection.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use hermes_ws::{ClientId, ClientRegistry, MemoryConnection, RegistryConfig};
///
/// let registry = ClientRegistry::new(RegistryConfig::default());
/// let id = ClientId::new();
/// registry.put(id, Arc::new(MemoryConnection::new()))?;
///
/// assert!(registry.get(&id).is_ok());
/// assert_eq!(registry.snapshot().len(), 1);
///
/// registry.remove(&id);
/// registry.remove(&id);
/// assert!(registry.is_empty());
/// # Ok::<(), hermes_ws::WsError>(())
/// ```
pub struct ClientRegistry {
    entries: DashMap<ClientId, RegisteredClient>,
    config: RegistryConfig,
    /// Held for reading by `put`, for writing by `close`.
    closed: RwLock<bool>,
    active: AtomicUsize,
    next_seq: AtomicU64,
    total_registered: AtomicUsize,
    total_rejected: AtomicUsize,
    total_removed: AtomicUsize,
}

impl ClientRegistry {
    /// Create a new registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            closed: RwLock::new(false),
            active: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            total_registered: AtomicUsize::new(0),
            total_rejected: AtomicUsize::new(0),
            total_removed: AtomicUsize::new(0),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert a connection.
    ///
    /// Fails with [`WsError::DuplicateId`] if `id` is present,
    /// [`WsError::CapacityReached`] if the configured limit is reached, and
    /// [`WsError::RegistryClosed`] once [`close`](Self::close) has run.
    pub fn put(&self, id: ClientId, connection: Arc<dyn ClientConnection>) -> WsResult<()> {
        let closed = self.closed.read();
        if *closed {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(WsError::RegistryClosed);
        }

        self.reserve_slot()?;

        match self.entries.entry(id) {
            Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %id, "Duplicate client id");
                Err(WsError::DuplicateId { client_id: id })
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredClient {
                    id,
                    connection,
                    connected_at: Instant::now(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                self.total_registered.fetch_add(1, Ordering::Relaxed);
                debug!(client_id = %id, "Client registered");
                Ok(())
            }
        }
    }

    fn reserve_slot(&self) -> WsResult<()> {
        let Some(limit) = self.config.max_connections else {
            self.active.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };

        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            });

        if reserved.is_err() {
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(max = limit, "Connection limit reached");
            return Err(WsError::CapacityReached { limit });
        }
        Ok(())
    }

    /// Look up a connection.
    ///
    /// Fails with [`WsError::NotConnected`] when `id` is not registered.
    pub fn get(&self, id: &ClientId) -> WsResult<RegisteredClient> {
        self.entries
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| WsError::not_connected(*id))
    }

    /// Remove a connection. Removing an absent id is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, id: &ClientId) -> bool {
        let removed = self.entries.remove(id).is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.total_removed.fetch_add(1, Ordering::Relaxed);
            debug!(client_id = %id, "Client removed");
        }
        removed
    }

    /// A point-in-time copy of every entry, in insertion order.
    pub fn snapshot(&self) -> Vec<RegisteredClient> {
        let mut clients: Vec<RegisteredClient> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        clients.sort_by_key(|client| client.seq);
        clients
    }

    /// Remove every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let ids: Vec<ClientId> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Refuse all further inserts.
    ///
    /// Once this returns, no concurrent `put` can still complete.
    pub fn close(&self) {
        let mut closed = self.closed.write();
        if !*closed {
            *closed = true;
            info!(clients = self.entries.len(), "Client registry closed");
        }
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    /// Check whether `id` is registered.
    pub fn contains(&self, id: &ClientId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of every registered connection, in insertion order.
    pub fn ids(&self) -> Vec<ClientId> {
        self.snapshot().into_iter().map(|client| client.id).collect()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.entries.len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("len", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use std::collections::HashSet;

    fn conn() -> Arc<dyn ClientConnection> {
        Arc::new(MemoryConnection::new())
    }

    #[test]
    fn test_put_and_get() {
        let registry = ClientRegistry::default();
        let id = ClientId::new();

        registry.put(id, conn()).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_is_not_connected() {
        let registry = ClientRegistry::default();
        let id = ClientId::new();
        let err = registry.get(&id).unwrap_err();
        assert!(matches!(err, WsError::NotConnected { client_id } if client_id == id));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ClientRegistry::default();
        let id = ClientId::new();

        registry.put(id, conn()).unwrap();
        let err = registry.put(id, conn()).unwrap_err();
        assert!(matches!(err, WsError::DuplicateId { .. }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().total_rejected, 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ClientRegistry::default();
        let id = ClientId::new();

        registry.put(id, conn()).unwrap();
        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(!registry.remove(&ClientId::new()));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_removed, 1);
    }

    #[test]
    fn test_snapshot_is_insertion_ordered() {
        let registry = ClientRegistry::default();
        let ids: Vec<ClientId> = (0..16).map(|_| ClientId::new()).collect();
        for id in &ids {
            registry.put(*id, conn()).unwrap();
        }

        assert_eq!(registry.ids(), ids);
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let registry = ClientRegistry::default();
        let first = ClientId::new();
        let second = ClientId::new();
        registry.put(first, conn()).unwrap();
        registry.put(second, conn()).unwrap();

        let snapshot = registry.snapshot();
        for client in &snapshot {
            registry.remove(&client.id);
            registry.put(ClientId::new(), conn()).unwrap();
        }

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(&first));
        assert!(!registry.contains(&second));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ClientRegistry::new(RegistryConfig::new().max_connections(2));
        let a = ClientId::new();

        registry.put(a, conn()).unwrap();
        registry.put(ClientId::new(), conn()).unwrap();
        let err = registry.put(ClientId::new(), conn()).unwrap_err();
        assert!(matches!(err, WsError::CapacityReached { limit: 2 }));

        // Removing frees the slot.
        registry.remove(&a);
        registry.put(ClientId::new(), conn()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_does_not_leak_capacity() {
        let registry = ClientRegistry::new(RegistryConfig::new().max_connections(1));
        let id = ClientId::new();

        registry.put(id, conn()).unwrap();
        assert!(registry.put(id, conn()).is_err());
        registry.remove(&id);
        registry.put(ClientId::new(), conn()).unwrap();
    }

    #[test]
    fn test_clear() {
        let registry = ClientRegistry::default();
        for _ in 0..5 {
            registry.put(ClientId::new(), conn()).unwrap();
        }

        assert_eq!(registry.clear(), 5);
        assert!(registry.is_empty());
        assert_eq!(registry.clear(), 0);
    }

    #[test]
    fn test_closed_registry_rejects_put() {
        let registry = ClientRegistry::default();
        registry.close();
        registry.close();

        assert!(registry.is_closed());
        let err = registry.put(ClientId::new(), conn()).unwrap_err();
        assert!(matches!(err, WsError::RegistryClosed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_remove() {
        let registry = Arc::new(ClientRegistry::default());
        let mut handles = Vec::new();

        for task in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut kept = Vec::new();
                for i in 0..50 {
                    let id = ClientId::new();
                    registry.put(id, conn()).unwrap();
                    // Snapshots taken mid-mutation never see duplicates.
                    let snapshot = registry.snapshot();
                    let unique: HashSet<ClientId> = snapshot.iter().map(|c| c.id).collect();
                    assert_eq!(unique.len(), snapshot.len());
                    if (task + i) % 2 == 0 {
                        assert!(registry.remove(&id));
                    } else {
                        kept.push(id);
                    }
                }
                kept
            }));
        }

        let mut expected = HashSet::new();
        for handle in handles {
            expected.extend(handle.await.unwrap());
        }

        let actual: HashSet<ClientId> = registry.ids().into_iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(registry.len(), expected.len());
        assert_eq!(registry.stats().total_registered, 32 * 50);
    }
}
