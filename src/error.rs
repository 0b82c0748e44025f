//! Error types for the peer lobby session.

use thiserror::Error;

use crate::protocol::{PeerId, TeamId};

/// Errors that can occur when using the lobby session.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// Failed to send a message through a data connection.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from a data connection.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The data connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Inbound bytes did not form a valid protocol message.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A connection for this peer is already registered.
    #[error("connection for id {0} exists")]
    DuplicateConnection(PeerId),

    /// No live connection is registered for this peer.
    #[error("no connection registered for id {0}")]
    NoConnection(PeerId),

    /// The peer id is already claimed on the connection broker.
    #[error("peer id {0} is already taken")]
    PeerIdTaken(PeerId),

    /// The peer could not be reached through the connection broker.
    #[error("peer {0} is unavailable")]
    PeerUnavailable(PeerId),

    /// The session loop has stopped; no further actions are accepted.
    #[error("session is not running")]
    NotConnected,

    /// The action requires a registered session (hosting or joined).
    #[error("session is not registered with a lobby")]
    NotRegistered,

    /// Registration was attempted twice.
    #[error("session is already registered as {0}")]
    AlreadyRegistered(PeerId),

    /// The action is reserved for the lobby host.
    #[error("only the lobby host may do this")]
    NotHost,

    /// The referenced team does not exist in the roster.
    #[error("unknown team {0}")]
    UnknownTeam(TeamId),

    /// The referenced member does not exist in the roster.
    #[error("unknown member {0}")]
    UnknownMember(PeerId),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons inbound bytes fail to decode into a [`Message`](crate::protocol::Message).
///
/// Decode failures are reported to the caller and never tear down the
/// connection that delivered the bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a JSON object.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A mandatory envelope field is absent.
    #[error("missing envelope field `{0}`")]
    MissingField(&'static str),

    /// The `protocol` field names a protocol this crate does not speak.
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    /// The `type` field is not a known message type.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// The payload does not match the shape required by its message type.
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload {
        /// Wire name of the message type.
        kind: &'static str,
        /// Parser detail.
        reason: String,
    },
}

/// A specialized [`Result`] type for lobby session operations.
pub type Result<T> = std::result::Result<T, LobbyError>;
