//! In-process connection broker.
//!
//! [`MemoryBroker`] stands in for the signaling server: every
//! [`MemoryNetwork`] created from the same broker can reach every other one by
//! peer id. Data connections are pairs of unbounded channels, so delivery is
//! immediate and ordered. Used by the integration tests and the
//! `local_lobby` demo.
//!
//! ```
//! use peer_lobby::transports::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! let host_network = broker.network();
//! let guest_network = broker.network();
//! # drop((host_network, guest_network));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::LobbyError;
use crate::protocol::PeerId;
use crate::transport::{PeerNetwork, Transport};

type Inbox = mpsc::UnboundedSender<(PeerId, MemoryConnection)>;

// ── Broker ──────────────────────────────────────────────────────────

/// Shared registry of listening peers.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    listeners: Arc<Mutex<HashMap<PeerId, Inbox>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unregistered broker client.
    pub fn network(&self) -> MemoryNetwork {
        MemoryNetwork {
            broker: self.clone(),
            my_id: None,
            incoming: None,
            closed: false,
        }
    }

    /// Whether `peer_id` is currently registered and accepting connections.
    pub fn is_listening(&self, peer_id: &str) -> bool {
        self.lock()
            .get(peer_id)
            .is_some_and(|inbox| !inbox.is_closed())
    }

    /// Forcibly drop a peer's registration, as a signaling server would on
    /// disconnect. The peer's next [`accept`](PeerNetwork::accept) returns `None`.
    pub fn disconnect(&self, peer_id: &str) -> bool {
        self.lock().remove(peer_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Inbox>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Network client ──────────────────────────────────────────────────

/// One peer's view of a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryNetwork {
    broker: MemoryBroker,
    my_id: Option<PeerId>,
    incoming: Option<mpsc::UnboundedReceiver<(PeerId, MemoryConnection)>>,
    closed: bool,
}

impl MemoryNetwork {
    pub fn my_id(&self) -> Option<&PeerId> {
        self.my_id.as_ref()
    }

    fn deregister(&mut self) {
        // Dropping the receiver closes our inbox; only then is the entry ours
        // to remove, since a newer listener may have claimed the id.
        self.incoming = None;
        if let Some(id) = self.my_id.take() {
            let mut listeners = self.broker.lock();
            if listeners.get(&id).is_some_and(|inbox| inbox.is_closed()) {
                listeners.remove(&id);
                debug!(peer_id = %id, "memory network deregistered");
            }
        }
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    type Connection = MemoryConnection;

    async fn listen(&mut self, my_id: &PeerId) -> Result<(), LobbyError> {
        if let Some(existing) = &self.my_id {
            return Err(LobbyError::AlreadyRegistered(existing.clone()));
        }
        let mut listeners = self.broker.lock();
        if listeners.get(my_id).is_some_and(|inbox| !inbox.is_closed()) {
            return Err(LobbyError::PeerIdTaken(my_id.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(my_id.clone(), tx);
        drop(listeners);

        self.my_id = Some(my_id.clone());
        self.incoming = Some(rx);
        self.closed = false;
        debug!(peer_id = %my_id, "memory network listening");
        Ok(())
    }

    async fn connect(&mut self, peer_id: &PeerId) -> Result<MemoryConnection, LobbyError> {
        let my_id = self.my_id.clone().ok_or(LobbyError::NotRegistered)?;
        let inbox = self
            .broker
            .lock()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| LobbyError::PeerUnavailable(peer_id.clone()))?;

        let (local, remote) = MemoryConnection::pair();
        inbox
            .send((my_id, remote))
            .map_err(|_| LobbyError::PeerUnavailable(peer_id.clone()))?;
        Ok(local)
    }

    async fn accept(&mut self) -> Option<Result<(PeerId, MemoryConnection), LobbyError>> {
        if self.closed {
            return None;
        }
        match self.incoming.as_mut() {
            Some(rx) => rx.recv().await.map(Ok),
            // Not listening yet: nothing can arrive.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        self.closed = true;
        self.deregister();
        Ok(())
    }
}

impl Drop for MemoryNetwork {
    fn drop(&mut self) {
        self.deregister();
    }
}

// ── Data connection ─────────────────────────────────────────────────

/// One end of an in-memory data connection.
///
/// [`recv`](Transport::recv) is cancel-safe because it only awaits an
/// `mpsc` receiver.
#[derive(Debug)]
pub struct MemoryConnection {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnection {
    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: a_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: b_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    async fn send(&mut self, message: String) -> Result<(), LobbyError> {
        let tx = self.tx.as_ref().ok_or(LobbyError::TransportClosed)?;
        tx.send(message).map_err(|_| LobbyError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        // The remote's recv yields None once our sender is gone.
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_ways_and_close_ends_remote() {
        let (mut a, mut b) = MemoryConnection::pair();
        a.send("to-b".into()).await.unwrap();
        b.send("to-a".into()).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), "to-b");
        assert_eq!(a.recv().await.unwrap().unwrap(), "to-a");

        a.close().await.unwrap();
        assert!(b.recv().await.is_none());
        assert!(matches!(
            a.send("late".into()).await,
            Err(LobbyError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn connect_reaches_listener_with_caller_id() {
        let broker = MemoryBroker::new();
        let mut host = broker.network();
        let mut guest = broker.network();
        host.listen(&"host".to_string()).await.unwrap();
        guest.listen(&"guest".to_string()).await.unwrap();

        let mut outbound = guest.connect(&"host".to_string()).await.unwrap();
        let (from, mut inbound) = host.accept().await.unwrap().unwrap();
        assert_eq!(from, "guest");

        outbound.send("hi".into()).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().unwrap(), "hi");
    }

    #[tokio::test]
    async fn listen_rejects_taken_id() {
        let broker = MemoryBroker::new();
        let mut first = broker.network();
        let mut second = broker.network();
        first.listen(&"dup".to_string()).await.unwrap();
        let err = second.listen(&"dup".to_string()).await.unwrap_err();
        assert!(matches!(err, LobbyError::PeerIdTaken(_)));
    }

    #[tokio::test]
    async fn connect_to_unknown_peer_is_unavailable() {
        let broker = MemoryBroker::new();
        let mut guest = broker.network();
        guest.listen(&"guest".to_string()).await.unwrap();
        let err = guest.connect(&"nobody".to_string()).await.unwrap_err();
        assert!(matches!(err, LobbyError::PeerUnavailable(_)));
    }

    #[tokio::test]
    async fn connect_before_listen_is_not_registered() {
        let broker = MemoryBroker::new();
        let mut guest = broker.network();
        let err = guest.connect(&"host".to_string()).await.unwrap_err();
        assert!(matches!(err, LobbyError::NotRegistered));
    }

    #[tokio::test]
    async fn close_and_drop_release_the_id() {
        let broker = MemoryBroker::new();
        let mut first = broker.network();
        first.listen(&"id".to_string()).await.unwrap();
        first.close().await.unwrap();
        assert!(!broker.is_listening("id"));
        assert!(first.accept().await.is_none());

        let mut second = broker.network();
        second.listen(&"id".to_string()).await.unwrap();
        drop(second);
        assert!(!broker.is_listening("id"));
    }

    #[tokio::test]
    async fn broker_disconnect_ends_accept() {
        let broker = MemoryBroker::new();
        let mut host = broker.network();
        host.listen(&"host".to_string()).await.unwrap();
        assert!(broker.disconnect("host"));
        assert!(host.accept().await.is_none());
    }
}
