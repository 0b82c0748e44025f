//! Peer id → live connection handle.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{LobbyError, Result};
use crate::protocol::PeerId;

/// Outbound side of one data connection.
///
/// Sending queues the text for the connection's pump task and never blocks.
/// Dropping the handle asks the pump to close the underlying transport.
pub struct ConnectionHandle {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        peer_id: PeerId,
        outbound: mpsc::UnboundedSender<String>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            peer_id,
            outbound,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// A handle with no pump task behind it. Whatever is sent shows up on the
    /// returned receiver, which makes it useful for driving a
    /// [`Session`](crate::session::Session) directly.
    pub fn detached(peer_id: impl Into<PeerId>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            peer_id: peer_id.into(),
            outbound,
            shutdown: None,
            task: None,
        };
        (handle, rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Queue one encoded message.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::TransportClosed`] if the pump has stopped.
    pub fn send(&self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| LobbyError::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.is_closed())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        // The pump closes its transport when signalled; it may already have
        // exited if the remote side closed first.
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Single source of truth for which peers this session can talk to.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PeerId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live connection.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::DuplicateConnection`] if the peer already has an
    /// entry. The rejected handle is dropped, which closes it; the existing
    /// entry is untouched.
    pub fn register(&mut self, handle: ConnectionHandle) -> Result<()> {
        if self.connections.contains_key(handle.peer_id()) {
            return Err(LobbyError::DuplicateConnection(handle.peer_id().clone()));
        }
        debug!(peer_id = %handle.peer_id(), "connection registered");
        self.connections.insert(handle.peer_id().clone(), handle);
        Ok(())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&ConnectionHandle> {
        self.connections.get(peer_id)
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<ConnectionHandle> {
        self.connections.remove(peer_id)
    }

    /// Queue `text` on the peer's connection.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NoConnection`] if the peer has no entry, or
    /// [`LobbyError::TransportClosed`] if its pump has stopped.
    pub fn send(&self, peer_id: &str, text: String) -> Result<()> {
        self.connections
            .get(peer_id)
            .ok_or_else(|| LobbyError::NoConnection(peer_id.to_string()))?
            .send(text)
    }

    /// Ids of every registered peer, sorted.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every handle, closing all connections.
    pub fn close_all(&mut self) {
        for (peer_id, _handle) in self.connections.drain() {
            debug!(%peer_id, "closing connection");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_live_duplicate() {
        let mut registry = ConnectionRegistry::new();
        let (first, mut first_rx) = ConnectionHandle::detached("peer-a");
        let (second, _second_rx) = ConnectionHandle::detached("peer-a");

        registry.register(first).unwrap();
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, LobbyError::DuplicateConnection(ref id) if id == "peer-a"));

        // The original entry still delivers.
        registry.send("peer-a", "hello".into()).unwrap();
        assert_eq!(first_rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn send_to_unknown_peer_is_no_connection() {
        let registry = ConnectionRegistry::new();
        let err = registry.send("ghost", "x".into()).unwrap_err();
        assert!(matches!(err, LobbyError::NoConnection(_)));
    }

    #[test]
    fn remove_then_register_again() {
        let mut registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::detached("peer-a");
        registry.register(first).unwrap();
        assert!(registry.remove("peer-a").is_some());
        assert!(!registry.contains("peer-a"));

        let (again, _rx2) = ConnectionHandle::detached("peer-a");
        registry.register(again).unwrap();
        assert_eq!(registry.peer_ids(), vec!["peer-a".to_string()]);
    }

    #[test]
    fn send_after_receiver_dropped_is_transport_closed() {
        let mut registry = ConnectionRegistry::new();
        let (handle, rx) = ConnectionHandle::detached("peer-a");
        registry.register(handle).unwrap();
        drop(rx);
        let err = registry.send("peer-a", "x".into()).unwrap_err();
        assert!(matches!(err, LobbyError::TransportClosed));
    }

    #[test]
    fn close_all_empties_registry() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = ConnectionHandle::detached("a");
        let (b, _rx_b) = ConnectionHandle::detached("b");
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        registry.close_all();
        assert!(registry.is_empty());
    }
}
