//! Transport abstraction consumed by the lobby session.
//!
//! Two traits describe the external connection broker:
//!
//! - [`Transport`] is one established, bidirectional data connection to a
//!   single remote peer. It shuttles complete JSON text messages; framing is
//!   the implementation's concern (WebRTC data channel, WebSocket, QUIC stream…).
//! - [`PeerNetwork`] is the broker client: it registers this peer's id
//!   ([`listen`](PeerNetwork::listen)), dials other peers
//!   ([`connect`](PeerNetwork::connect)) and yields connections dialed by others
//!   ([`accept`](PeerNetwork::accept)). Signaling and NAT traversal live
//!   entirely behind this trait.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use peer_lobby::error::LobbyError;
//! use peer_lobby::transport::Transport;
//!
//! struct MyDataChannel { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyDataChannel {
//!     async fn send(&mut self, message: String) -> Result<(), LobbyError> {
//!         // Send one JSON text message to the remote peer
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
//!         // Receive the next JSON text message
//!         // Return None when the remote peer closed the connection
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), LobbyError> {
//!         // Tear the channel down
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::LobbyError;
use crate::protocol::PeerId;

/// A bidirectional text message connection to one remote peer.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::UnboundedReceiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the remote peer.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::TransportSend`] if the message could not be sent,
    /// or [`LobbyError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, message: String) -> Result<(), LobbyError>;

    /// Receive the next JSON text message from the remote peer.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the remote peer closed the connection
    async fn recv(&mut self) -> Option<Result<String, LobbyError>>;

    /// Close the connection. Implementations release resources even if the
    /// close handshake fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails.
    async fn close(&mut self) -> Result<(), LobbyError>;
}

/// Client of the signaling / connection broker.
///
/// Both [`listen`](PeerNetwork::listen) and [`connect`](PeerNetwork::connect)
/// wait for an external handshake. The session wraps them in a timeout, so an
/// implementation may simply await the broker's "open" notification.
#[async_trait]
pub trait PeerNetwork: Send + 'static {
    /// The data connection type produced by this broker.
    type Connection: Transport;

    /// Register `my_id` with the broker. Resolves once the broker reports the
    /// registration open.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::PeerIdTaken`] if the id is already claimed, or any
    /// broker error.
    async fn listen(&mut self, my_id: &PeerId) -> Result<(), LobbyError>;

    /// Dial `peer_id`. Resolves once the data connection is open.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::PeerUnavailable`] if the peer cannot be reached.
    async fn connect(&mut self, peer_id: &PeerId) -> Result<Self::Connection, LobbyError>;

    /// Wait for the next connection dialed by a remote peer, paired with that
    /// peer's id as reported by the broker.
    ///
    /// Returns `None` once the broker client has closed. Must be cancel-safe.
    async fn accept(&mut self) -> Option<Result<(PeerId, Self::Connection), LobbyError>>;

    /// Unregister from the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the shutdown.
    async fn close(&mut self) -> Result<(), LobbyError>;
}
