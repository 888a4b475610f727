//! Registry of live connections.
//!
//! `ConnectionRegistry` stores non-owning weak references to each
//! connection's [`FrameWriter`], so server-wide notifications can reach live
//! connections without keeping closed ones around. Dead entries are dropped
//! at lookup time or by [`ConnectionRegistry::prune`].

use std::sync::Weak;

use dashmap::DashMap;
use rpcmux_core::{ReconnectNotification, ServerMessage};

use crate::writer::{FrameWriter, WriterInner};

/// Identifier assigned to an accepted connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl ConnectionId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Concurrent map of connection writers keyed by [`ConnectionId`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry(DashMap<ConnectionId, Weak<WriterInner>>);

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The writer for `id`, if the connection is still open.
    pub fn get(&self, id: &ConnectionId) -> Option<FrameWriter> {
        let guard = self.0.get(id);
        let inner = guard.as_ref().and_then(|weak| weak.upgrade());
        drop(guard);
        if inner.is_none() {
            self.0.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        inner.map(FrameWriter::from_arc)
    }

    pub fn insert(&self, id: ConnectionId, writer: &FrameWriter) {
        self.0.insert(id, writer.downgrade());
    }

    pub fn remove(&self, id: &ConnectionId) {
        self.0.remove(id);
    }

    /// Drop entries whose connection has gone away.
    pub fn prune(&self) {
        self.0.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Prune, then return the ids of the live connections.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::with_capacity(self.0.len());
        self.0.retain(|id, weak| {
            if weak.strong_count() > 0 {
                ids.push(*id);
                true
            } else {
                false
            }
        });
        ids
    }

    /// Number of registered entries, including ones not yet pruned.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ask every open connection to reconnect.
    ///
    /// Never waits: a connection whose outbound queue is full misses the
    /// notification. Returns how many connections it was queued for.
    pub fn broadcast_reconnect_notification(&self) -> usize {
        let mut writers = Vec::with_capacity(self.0.len());
        self.0.retain(|_, weak| match weak.upgrade() {
            Some(inner) => {
                writers.push(FrameWriter::from_arc(inner));
                true
            }
            None => false,
        });
        let delivered = writers
            .iter()
            .filter(|writer| writer.try_send(ServerMessage::Reconnect(ReconnectNotification)))
            .count();
        tracing::info!(connections = writers.len(), delivered, "broadcast reconnect notification");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Outbound;
    use serde_json::json;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "ConnectionId(7)");
        assert_eq!(ConnectionId::from(7).as_u64(), 7);
    }

    #[test]
    fn test_get_returns_live_writer() {
        let registry = ConnectionRegistry::new();
        let (writer, _rx) = FrameWriter::new(4);
        registry.insert(ConnectionId::new(1), &writer);
        assert!(registry.get(&ConnectionId::new(1)).is_some());
        assert!(registry.get(&ConnectionId::new(2)).is_none());
    }

    #[test]
    fn test_dropped_writer_is_pruned_on_lookup() {
        let registry = ConnectionRegistry::new();
        let (writer, _rx) = FrameWriter::new(4);
        registry.insert(ConnectionId::new(1), &writer);
        drop(writer);
        assert!(registry.get(&ConnectionId::new(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_active_ids_skips_dead_entries() {
        let registry = ConnectionRegistry::new();
        let (live, _rx1) = FrameWriter::new(4);
        let (dead, _rx2) = FrameWriter::new(4);
        registry.insert(ConnectionId::new(1), &live);
        registry.insert(ConnectionId::new(2), &dead);
        drop(dead);
        assert_eq!(registry.active_ids(), vec![ConnectionId::new(1)]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_reaches_open_connections() {
        let registry = ConnectionRegistry::new();
        let (open, mut open_rx) = FrameWriter::new(4);
        let (closed, mut closed_rx) = FrameWriter::new(4);
        let (gone, _gone_rx) = FrameWriter::new(4);
        registry.insert(ConnectionId::new(1), &open);
        registry.insert(ConnectionId::new(2), &closed);
        registry.insert(ConnectionId::new(3), &gone);
        closed.mark_closed();
        drop(gone);

        assert_eq!(registry.broadcast_reconnect_notification(), 1);
        match open_rx.try_recv().unwrap() {
            Outbound::Frame(message) => assert_eq!(
                serde_json::to_value(&message).unwrap(),
                json!({"id": null, "method": "reconnect"})
            ),
            other => panic!("unexpected {other:?}"),
        }
        assert!(closed_rx.try_recv().is_err());
        assert_eq!(registry.len(), 2);
    }
}
