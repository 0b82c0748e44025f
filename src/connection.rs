//! Per-connection pump task.
//!
//! [`spawn_connection`] moves a [`Transport`] into its own task that
//! multiplexes outbound text and inbound frames via `tokio::select!`. Everything
//! the remote side does is reported as a [`ConnectionEvent`] on one shared
//! channel, so the session loop sees all connections as a single ordered
//! stream and stays the only writer of lobby state.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::LobbyError;
use crate::protocol::PeerId;
use crate::registry::ConnectionHandle;
use crate::transport::Transport;

/// Something happened on one data connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// One complete text message arrived.
    Data { peer_id: PeerId, text: String },
    /// The transport reported an error. A [`Closed`](Self::Closed) follows.
    Error { peer_id: PeerId, error: LobbyError },
    /// The connection is gone. Emitted once, and never for a local close.
    Closed { peer_id: PeerId },
}

impl ConnectionEvent {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Data { peer_id, .. } | Self::Error { peer_id, .. } | Self::Closed { peer_id } => {
                peer_id
            }
        }
    }
}

/// Spawn the pump for an open connection and return its outbound handle.
///
/// Dropping the returned handle flushes queued text, closes the transport and
/// ends the task without emitting [`ConnectionEvent::Closed`].
pub fn spawn_connection<T: Transport>(
    peer_id: PeerId,
    transport: T,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(pump(
        peer_id.clone(),
        transport,
        outbound_rx,
        events,
        shutdown_rx,
    ));
    ConnectionHandle::new(peer_id, outbound_tx, shutdown_tx, task)
}

async fn pump<T: Transport>(
    peer_id: PeerId,
    mut transport: T,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(%peer_id, "connection pump started");

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = transport.send(text).await {
                            error!(%peer_id, "transport send error: {e}");
                            report_failure(&events, &peer_id, e);
                            break;
                        }
                    }
                    // Handle dropped.
                    None => {
                        close_transport(&mut transport, &peer_id).await;
                        break;
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!(%peer_id, "local close requested");
                while let Ok(text) = outbound_rx.try_recv() {
                    if transport.send(text).await.is_err() {
                        break;
                    }
                }
                close_transport(&mut transport, &peer_id).await;
                break;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        let _ = events.send(ConnectionEvent::Data {
                            peer_id: peer_id.clone(),
                            text,
                        });
                    }
                    Some(Err(e)) => {
                        error!(%peer_id, "transport receive error: {e}");
                        report_failure(&events, &peer_id, e);
                        break;
                    }
                    None => {
                        debug!(%peer_id, "connection closed by remote");
                        let _ = events.send(ConnectionEvent::Closed {
                            peer_id: peer_id.clone(),
                        });
                        break;
                    }
                }
            }
        }
    }

    debug!(%peer_id, "connection pump exited");
}

fn report_failure(
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    peer_id: &PeerId,
    error: LobbyError,
) {
    let _ = events.send(ConnectionEvent::Error {
        peer_id: peer_id.clone(),
        error,
    });
    let _ = events.send(ConnectionEvent::Closed {
        peer_id: peer_id.clone(),
    });
}

async fn close_transport<T: Transport>(transport: &mut T, peer_id: &PeerId) {
    if let Err(e) = transport.close().await {
        warn!(%peer_id, "error while closing transport: {e}");
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
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    struct ScriptedTransport {
        incoming: VecDeque<Option<Result<String, LobbyError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedTransport {
        fn new(
            incoming: Vec<Option<Result<String, LobbyError>>>,
        ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let transport = Self {
                incoming: VecDeque::from(incoming),
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            };
            (transport, sent, closed)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: String) -> Result<(), LobbyError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), LobbyError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn data_then_remote_close() {
        let (transport, _sent, closed) =
            ScriptedTransport::new(vec![Some(Ok("hello".into())), None]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_connection("peer-a".into(), transport, tx);

        match next_event(&mut rx).await {
            ConnectionEvent::Data { peer_id, text } => {
                assert_eq!(peer_id, "peer-a");
                assert_eq!(text, "hello");
            }
            other => panic!("expected Data, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { .. }
        ));
        assert!(!closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn receive_error_reports_error_then_closed() {
        let (transport, _sent, _closed) =
            ScriptedTransport::new(vec![Some(Err(LobbyError::TransportReceive("boom".into())))]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_connection("peer-a".into(), transport, tx);

        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Error { .. }
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn outbound_text_reaches_transport() {
        let (transport, sent, _closed) = ScriptedTransport::new(vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = spawn_connection("peer-a".into(), transport, tx);

        handle.send("one".into()).unwrap();
        handle.send("two".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*sent.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn dropping_handle_flushes_and_closes_silently() {
        let (transport, sent, closed) = ScriptedTransport::new(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_connection("peer-a".into(), transport, tx);

        handle.send("last words".into()).unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(closed.load(Ordering::Relaxed));
        assert_eq!(*sent.lock().unwrap(), vec!["last words"]);
        // The pump exited, dropping its sender, without a Closed event.
        assert!(rx.recv().await.is_none());
    }
}
