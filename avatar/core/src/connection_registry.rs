//! Connection Registry
//!
//! Tracks every live client connection and routes outbound messages to it.
//!
//! # Design
//!
//! - Each connection owns an `mpsc` receiver; the registry only holds the
//!   sending half, so dropping a registration never blocks the transport.
//! - Every registration gets a generation number. Re-registering an id
//!   closes the previous handle (reason [`CloseReason::Replaced`]) before
//!   the new one is stored, and [`ConnectionRegistry::remove`] ignores
//!   stale generations so a replaced connection cannot evict its successor.
//! - Per-connection order equals send-call order (one channel per
//!   connection); there is no ordering across connections.
//!
//! # Thread Safety
//!
//! The registry is a cheap `Clone` over an `Arc<RwLock<..>>`. Async sends
//! clone the sender out of the lock before awaiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::messages::OutboundMessage;

/// Unique identifier for a client connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a client-chosen id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the registry closed a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Another connection registered under the same id
    Replaced,
    /// The connection was removed after a disconnect
    Disconnected,
    /// The server is shutting down
    Shutdown,
}

impl CloseReason {
    /// Short name for logs and close frames
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Resolves when the registry closes the connection
///
/// Also resolves (with `Err`) if the handle is dropped without an explicit
/// close, which the transport should treat the same way.
pub type CloseSignal = oneshot::Receiver<CloseReason>;

/// Sending side of one connection
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<OutboundMessage>,
    close_tx: Option<oneshot::Sender<CloseReason>>,
}

impl ConnectionHandle {
    /// Create a handle and the close signal its transport should watch
    #[must_use]
    pub fn new(id: ConnectionId, tx: mpsc::Sender<OutboundMessage>) -> (Self, CloseSignal) {
        let (close_tx, close_rx) = oneshot::channel();
        (
            Self {
                id,
                tx,
                close_tx: Some(close_tx),
            },
            close_rx,
        )
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Whether the transport is still receiving
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn try_send(&self, message: OutboundMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }

    fn close(mut self, reason: CloseReason) {
        if let Some(close_tx) = self.close_tx.take() {
            // receiver gone means the transport already exited
            let _ = close_tx.send(reason);
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Proof of one registration, needed to remove it again
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    /// Registered id
    pub id: ConnectionId,
    /// Generation assigned at registration
    pub generation: u64,
}

struct Entry {
    generation: u64,
    handle: ConnectionHandle,
}

/// Result of a broadcast operation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of connections the message reached
    pub successful: usize,
    /// Number of connections that could not take the message
    pub failed: usize,
    /// Ids of the failed connections
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all sends succeeded
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Check if all sends failed
    #[must_use]
    pub fn all_failed(&self) -> bool {
        self.successful == 0 && self.failed > 0
    }
}

/// Registry of live connections
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, closing any previous one with the same id
    pub fn register(&self, handle: ConnectionHandle) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let id = handle.id.clone();

        let previous = {
            let mut inner = self.inner.write();
            inner.insert(id.clone(), Entry { generation, handle })
        };

        if let Some(previous) = previous {
            tracing::warn!(
                connection_id = %id,
                previous_generation = previous.generation,
                generation,
                "Connection id re-registered, closing previous handle"
            );
            previous.handle.close(CloseReason::Replaced);
        }

        tracing::info!(connection_id = %id, generation, "Connection registered");
        Registration { id, generation }
    }

    /// Remove a registration and close its handle
    ///
    /// Does nothing if the id has since been re-registered. Returns whether
    /// an entry was removed.
    pub fn remove(&self, registration: &Registration) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            match inner.get(&registration.id) {
                Some(entry) if entry.generation == registration.generation => {
                    inner.remove(&registration.id)
                }
                _ => None,
            }
        };

        match removed {
            Some(entry) => {
                entry.handle.close(CloseReason::Disconnected);
                tracing::info!(
                    connection_id = %registration.id,
                    generation = registration.generation,
                    "Connection removed"
                );
                true
            }
            None => {
                tracing::debug!(
                    connection_id = %registration.id,
                    generation = registration.generation,
                    "Stale removal ignored"
                );
                false
            }
        }
    }

    /// Get the number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Get all registered connection ids
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().keys().cloned().collect()
    }

    /// Send to one connection without waiting for channel capacity
    ///
    /// Returns true if the message was queued.
    pub fn send_to(&self, id: &ConnectionId, message: OutboundMessage) -> bool {
        let inner = self.inner.read();
        if let Some(entry) = inner.get(id) {
            entry.handle.try_send(message)
        } else {
            tracing::warn!(
                connection_id = %id,
                kind = message.kind(),
                "Attempted to send to unknown connection"
            );
            false
        }
    }

    /// Send to one connection, waiting for channel capacity
    ///
    /// Returns true if the message was queued.
    pub async fn send_to_async(&self, id: &ConnectionId, message: OutboundMessage) -> bool {
        let tx = {
            let inner = self.inner.read();
            inner.get(id).map(|entry| entry.handle.tx.clone())
        };

        if let Some(tx) = tx {
            tx.send(message).await.is_ok()
        } else {
            tracing::warn!(
                connection_id = %id,
                kind = message.kind(),
                "Attempted to send to unknown connection"
            );
            false
        }
    }

    /// Send to every connection without waiting
    pub fn broadcast(&self, message: &OutboundMessage) -> BroadcastResult {
        let inner = self.inner.read();
        let mut result = BroadcastResult::default();

        for (id, entry) in inner.iter() {
            if entry.handle.try_send(message.clone()) {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(id.clone());
            }
        }

        result
    }

    /// Send to every connection, waiting for capacity on each
    pub async fn broadcast_async(&self, message: OutboundMessage) -> BroadcastResult {
        let senders: Vec<_> = {
            let inner = self.inner.read();
            inner
                .iter()
                .map(|(id, entry)| (id.clone(), entry.handle.tx.clone()))
                .collect()
        };

        let mut result = BroadcastResult::default();
        for (id, tx) in senders {
            if tx.send(message.clone()).await.is_ok() {
                result.successful += 1;
            } else {
                result.failed += 1;
                result.failed_ids.push(id);
            }
        }
        result
    }

    /// Drop entries whose transport has gone away
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_disconnected(&self) -> usize {
        let stale: Vec<Entry> = {
            let mut inner = self.inner.write();
            let ids: Vec<ConnectionId> = inner
                .iter()
                .filter(|(_, entry)| !entry.handle.is_connected())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| inner.remove(id)).collect()
        };

        let removed = stale.len();
        for entry in stale {
            tracing::info!(connection_id = %entry.handle.id, "Removing disconnected connection");
            entry.handle.close(CloseReason::Disconnected);
        }
        if removed > 0 {
            tracing::info!(
                removed,
                remaining = self.count(),
                "Cleaned up disconnected connections"
            );
        }
        removed
    }

    /// Close and remove every connection
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let entries: Vec<Entry> = {
            let mut inner = self.inner.write();
            inner.drain().map(|(_, entry)| entry).collect()
        };
        let closed = entries.len();
        for entry in entries {
            entry.handle.close(reason);
        }
        if closed > 0 {
            tracing::info!(closed, reason = reason.as_str(), "Closed all connections");
        }
        closed
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &inner.len())
            .field("connections", &inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle(
        id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<OutboundMessage>, CloseSignal) {
        let (tx, rx) = mpsc::channel(32);
        let (handle, close) = ConnectionHandle::new(ConnectionId::new(id), tx);
        (handle, rx, close)
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx, mut close) = create_test_handle("c1");

        let registration = registry.register(handle);
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&ConnectionId::new("c1")));

        assert!(registry.remove(&registration));
        assert_eq!(registry.count(), 0);
        assert_eq!(close.try_recv(), Ok(CloseReason::Disconnected));

        // second removal is a no-op
        assert!(!registry.remove(&registration));
    }

    #[test]
    fn test_reregister_closes_previous() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1, mut first_close) = create_test_handle("c1");
        let (second, mut rx2, mut second_close) = create_test_handle("c1");

        let old = registry.register(first);
        let new = registry.register(second);
        assert!(new.generation > old.generation);
        assert_eq!(first_close.try_recv(), Ok(CloseReason::Replaced));
        assert_eq!(registry.count(), 1);

        // late disconnect of the replaced connection must not evict the new one
        assert!(!registry.remove(&old));
        assert!(registry.contains(&ConnectionId::new("c1")));
        assert!(second_close.try_recv().is_err());

        assert!(registry.send_to(&ConnectionId::new("c1"), OutboundMessage::Pong));
        assert_eq!(rx2.try_recv().unwrap(), OutboundMessage::Pong);
    }

    #[test]
    fn test_send_to_unknown() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to(&ConnectionId::new("ghost"), OutboundMessage::Pong));
    }

    #[test]
    fn test_send_order_preserved() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx, _close) = create_test_handle("c1");
        registry.register(handle);
        let id = ConnectionId::new("c1");

        for i in 0..5 {
            assert!(registry.send_to(&id, OutboundMessage::error(format!("m{i}"))));
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), OutboundMessage::error(format!("m{i}")));
        }
    }

    #[test]
    fn test_broadcast() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1, _c1) = create_test_handle("a");
        let (h2, mut rx2, _c2) = create_test_handle("b");
        registry.register(h1);
        registry.register(h2);

        let result = registry.broadcast(&OutboundMessage::Pong);
        assert_eq!(result.successful, 2);
        assert!(result.all_succeeded());
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_reports_failures() {
        let registry = ConnectionRegistry::new();
        let (h1, rx1, _c1) = create_test_handle("a");
        let (h2, _rx2, _c2) = create_test_handle("b");
        registry.register(h1);
        registry.register(h2);
        drop(rx1);

        let result = registry.broadcast(&OutboundMessage::Pong);
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failed_ids, vec![ConnectionId::new("a")]);
        assert!(!result.all_succeeded());
        assert!(!result.all_failed());
    }

    #[test]
    fn test_cleanup_disconnected() {
        let registry = ConnectionRegistry::new();
        let (h1, rx1, _c1) = create_test_handle("a");
        let (h2, _rx2, _c2) = create_test_handle("b");
        registry.register(h1);
        registry.register(h2);
        drop(rx1);

        assert_eq!(registry.cleanup_disconnected(), 1);
        assert_eq!(registry.connection_ids(), vec![ConnectionId::new("b")]);
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1, mut c1) = create_test_handle("a");
        let (h2, _rx2, mut c2) = create_test_handle("b");
        registry.register(h1);
        registry.register(h2);

        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(c1.try_recv(), Ok(CloseReason::Shutdown));
        assert_eq!(c2.try_recv(), Ok(CloseReason::Shutdown));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
    }

    #[tokio::test]
    async fn test_send_to_async() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx, _close) = create_test_handle("c1");
        registry.register(handle);

        assert!(
            registry
                .send_to_async(&ConnectionId::new("c1"), OutboundMessage::Pong)
                .await
        );
        assert_eq!(rx.recv().await, Some(OutboundMessage::Pong));
        assert!(
            !registry
                .send_to_async(&ConnectionId::new("ghost"), OutboundMessage::Pong)
                .await
        );
    }

    // ========================================
    // Concurrent Connection Tests
    // ========================================

    #[tokio::test]
    async fn test_concurrent_registration() {
        use tokio::task::JoinSet;

        let registry = ConnectionRegistry::new();
        let mut join_set = JoinSet::new();

        for _ in 0..10 {
            let registry = registry.clone();
            join_set.spawn(async move {
                let (tx, _rx) = mpsc::channel(32);
                let (handle, _close) = ConnectionHandle::new(ConnectionId::generate(), tx);
                registry.register(handle).generation
            });
        }

        let mut generations = Vec::new();
        while let Some(result) = join_set.join_next().await {
            generations.push(result.unwrap());
        }

        assert_eq!(registry.count(), 10);
        generations.sort_unstable();
        generations.dedup();
        assert_eq!(generations.len(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_broadcast() {
        use tokio::task::JoinSet;

        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (handle, rx, close) = create_test_handle(&format!("c{i}"));
            registry.register(handle);
            receivers.push((rx, close));
        }

        let mut join_set = JoinSet::new();
        for _ in 0..10 {
            let registry = registry.clone();
            join_set.spawn(async move { registry.broadcast_async(OutboundMessage::Pong).await });
        }

        while let Some(result) = join_set.join_next().await {
            let broadcast_result = result.unwrap();
            assert_eq!(broadcast_result.successful, 5);
            assert_eq!(broadcast_result.failed, 0);
        }

        for (mut rx, _close) in receivers {
            let mut count = 0;
            while rx.try_recv().is_ok() {
                count += 1;
            }
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn test_concurrent_replace_keeps_one_live_handle() {
        use tokio::task::JoinSet;

        let registry = ConnectionRegistry::new();
        let mut join_set = JoinSet::new();

        for _ in 0..8 {
            let registry = registry.clone();
            join_set.spawn(async move {
                let (tx, rx) = mpsc::channel(32);
                let (handle, close) = ConnectionHandle::new(ConnectionId::new("shared"), tx);
                let registration = registry.register(handle);
                (registration, rx, close)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(result) = join_set.join_next().await {
            outcomes.push(result.unwrap());
        }

        assert_eq!(registry.count(), 1);
        let replaced = outcomes
            .iter_mut()
            .map(|(_, _, close)| close.try_recv())
            .filter(|reason| *reason == Ok(CloseReason::Replaced))
            .count();
        assert_eq!(replaced, 7);

        // stale removals never evict the survivor
        for (registration, _, _) in &outcomes {
            registry.remove(registration);
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_specific_under_load() {
        use tokio::task::JoinSet;

        let registry = ConnectionRegistry::new();
        let (h1, mut rx1, _c1) = create_test_handle("one");
        let (h2, mut rx2, _c2) = create_test_handle("two");
        registry.register(h1);
        registry.register(h2);

        let mut join_set = JoinSet::new();
        for i in 0..20 {
            let registry = registry.clone();
            join_set.spawn(async move {
                let target = if i % 2 == 0 { "one" } else { "two" };
                registry
                    .send_to_async(&ConnectionId::new(target), OutboundMessage::Pong)
                    .await
            });
        }
        while let Some(result) = join_set.join_next().await {
            assert!(result.unwrap());
        }

        let mut one = 0;
        while rx1.try_recv().is_ok() {
            one += 1;
        }
        let mut two = 0;
        while rx2.try_recv().is_ok() {
            two += 1;
        }
        assert_eq!(one, 10);
        assert_eq!(two, 10);
    }
}
