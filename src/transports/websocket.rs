//! WebSocket data connection using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries lobby messages over one WebSocket, as a
//! stand-in data channel when peers can reach each other directly (LAN play,
//! a relay, or tests). Both `ws://` and `wss://` URLs are supported on the
//! dialing side. TLS is handled transparently via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream). The accepting side
//! wraps a plain [`TcpStream`] with [`WebSocketTransport::accept`].
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), peer_lobby::LobbyError> {
//! use peer_lobby::{Transport, WebSocketTransport};
//!
//! let mut transport = WebSocketTransport::connect("ws://192.168.1.20:7000").await?;
//! transport.send(r#"{"protocol":"CONNECTION"}"#.to_string()).await?;
//!
//! if let Some(Ok(msg)) = transport.recv().await {
//!     println!("received: {msg}");
//! }
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::LobbyError;
use crate::transport::Transport;

/// Stream type produced by [`WebSocketTransport::connect`].
pub type ClientStream = MaybeTlsStream<TcpStream>;

/// A [`Transport`] backed by a WebSocket connection over any byte stream `S`.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any messages,
/// making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport<S = ClientStream> {
    stream: WebSocketStream<S>,
    closed: bool,
}

impl WebSocketTransport<ClientStream> {
    /// Dial a WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, LobbyError> {
        tracing::debug!(url = %url, "connecting to WebSocket peer");

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(to_io_error)?;

        tracing::info!(url = %url, "WebSocket connection established");
        Ok(Self::from_stream(stream))
    }

    /// [`connect`](Self::connect) bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Timeout`] if the deadline elapses, or any
    /// error that [`connect`](Self::connect) may return.
    pub async fn connect_with_timeout(
        url: &str,
        timeout: std::time::Duration,
    ) -> Result<Self, LobbyError> {
        tokio::time::timeout(timeout, Self::connect(url))
            .await
            .map_err(|_| LobbyError::Timeout)?
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the server side of the WebSocket handshake on an accepted stream.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Io`] if the handshake fails.
    pub async fn accept(stream: S) -> Result<Self, LobbyError> {
        let stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(to_io_error)?;
        tracing::debug!("accepted WebSocket connection");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established WebSocket stream, for custom TLS, proxies
    /// or headers.
    pub fn from_stream(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

fn to_io_error(e: tokio_tungstenite::tungstenite::Error) -> LobbyError {
    let kind = match &e {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    LobbyError::Io(std::io::Error::new(kind, e))
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: String) -> Result<(), LobbyError> {
        if self.closed {
            return Err(LobbyError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| LobbyError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(LobbyError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                // Some data-channel bridges forward JSON as binary frames.
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("received non-UTF-8 binary WebSocket frame, skipping");
                    }
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite answers pings on the next read or write.
                    tracing::trace!("WebSocket control frame");
                }
                Message::Frame(_) => {
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| LobbyError::TransportSend(e.to_string()))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
        assert_send::<WebSocketTransport<TcpStream>>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::Io(_)));
    }

    #[tokio::test]
    async fn connect_with_timeout_times_out() {
        // Accepts the TCP connection but never answers the upgrade request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_silent, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = WebSocketTransport::connect_with_timeout(
            &format!("ws://{addr}"),
            std::time::Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LobbyError::Timeout));
    }

    /// Bind a local listener whose single accepted connection is wrapped with
    /// [`WebSocketTransport::accept`] and handed to `handler`.
    async fn start_peer<F, Fut>(handler: F) -> String
    where
        F: FnOnce(WebSocketTransport<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let transport = WebSocketTransport::accept(tcp).await.unwrap();
            handler(transport).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn accepted_and_dialed_ends_exchange_text() {
        let url = start_peer(|mut peer| async move {
            let text = peer.recv().await.unwrap().unwrap();
            peer.send(format!("echo:{text}")).await.unwrap();
            peer.close().await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.send("ping".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "echo:ping");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn utf8_binary_frames_are_accepted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Binary(vec![0xC3, 0x28].into()))
                .await
                .unwrap();
            ws.send(Message::Binary(b"{\"json\":1}".to_vec().into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let mut transport = WebSocketTransport::connect(&format!("ws://{addr}"))
            .await
            .unwrap();
        // Invalid UTF-8 is skipped; the JSON frame comes through.
        assert_eq!(transport.recv().await.unwrap().unwrap(), "{\"json\":1}");
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url = start_peer(|mut peer| async move { while let Some(Ok(_)) = peer.recv().await {} })
            .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, LobbyError::TransportClosed));
    }
}
